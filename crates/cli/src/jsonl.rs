// crates/cli/src/jsonl.rs
//! Batched reading of imported hands, one JSON object per line.

use std::path::Path;

use anyhow::{Context, Result};
use hudcache_core::ImportedHand;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedLine {
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct Batch {
    pub hands: Vec<ImportedHand>,
    pub malformed: Vec<MalformedLine>,
}

pub struct HandReader {
    lines: Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>,
    line_no: usize,
}

impl HandReader {
    pub fn new(reader: Box<dyn AsyncRead + Unpin + Send>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }

    /// `-` reads standard input.
    pub async fn open(path: &Path) -> Result<Self> {
        if path == Path::new("-") {
            return Ok(Self::new(Box::new(tokio::io::stdin())));
        }
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self::new(Box::new(file)))
    }

    /// Up to `size` hands. Lines that do not parse are collected, not
    /// fatal. `None` at end of input.
    pub async fn next_batch(&mut self, size: usize) -> Result<Option<Batch>> {
        let mut batch = Batch::default();
        while batch.hands.len() < size.max(1) {
            let Some(line) = self.lines.next_line().await.context("failed to read input")? else {
                break;
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ImportedHand>(&line) {
                Ok(hand) => batch.hands.push(hand),
                Err(e) => {
                    tracing::warn!(line = self.line_no, error = %e, "skipping malformed line");
                    batch.malformed.push(MalformedLine {
                        line: self.line_no,
                        error: e.to_string(),
                    });
                }
            }
        }
        if batch.hands.is_empty() && batch.malformed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HAND: &str = r#"{"handId":1,"startTime":"2024-03-15T20:00:00Z","facts":[{"handId":1,"playerId":10,"gametypeId":1,"seats":6,"maxPosition":5,"position":"B","stats":{"street0_vpi_chance":1,"street0_vpi":1}}]}"#;

    fn reader(input: String) -> HandReader {
        HandReader::new(Box::new(std::io::Cursor::new(input.into_bytes())))
    }

    #[tokio::test]
    async fn test_reads_in_batches() {
        let input = (0..5).map(|_| HAND).collect::<Vec<_>>().join("\n");
        let mut reader = reader(input);

        let sizes = [
            reader.next_batch(2).await.unwrap().unwrap().hands.len(),
            reader.next_batch(2).await.unwrap().unwrap().hands.len(),
            reader.next_batch(2).await.unwrap().unwrap().hands.len(),
        ];
        assert_eq!(sizes, [2, 2, 1]);
        assert!(reader.next_batch(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parses_fact_fields() {
        let mut reader = reader(HAND.to_string());
        let batch = reader.next_batch(10).await.unwrap().unwrap();
        let fact = &batch.hands[0].facts[0];
        assert_eq!(fact.player_id, 10);
        assert_eq!(fact.position.as_char(), 'B');
        assert_eq!(fact.stats.street0_vpi, 1);
        assert_eq!(fact.tourney_type_id, None);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_collected_with_line_numbers() {
        let input = format!("{HAND}\n\nnot json\n{{\"handId\":2}}\n{HAND}\n");
        let mut reader = reader(input);

        let batch = reader.next_batch(10).await.unwrap().unwrap();
        assert_eq!(batch.hands.len(), 2);
        let lines: Vec<usize> = batch.malformed.iter().map(|m| m.line).collect();
        assert_eq!(lines, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(HandReader::open(&tmp.path().join("absent.jsonl")).await.is_err());
    }
}
