//! Reader for the agent CLI's `stream-json` output.
//!
//! The CLI prints one JSON object per line, discriminated by a `type` field.
//! Only three line kinds matter to the engine: the opening `system` line
//! (carries the provider session id), `assistant` turns (text the engine may
//! need if the run dies before a result line), and the closing `result` line
//! (final text, spend, turn count, error flag). Everything else on the
//! stream, including tool traffic, is deliberately skipped.

use serde::Deserialize;

/// One line of the stream. Variants not listed here collapse into `Other`
/// so future line kinds never break parsing.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    System {
        session_id: Option<String>,
    },
    Assistant {
        message: Option<Turn>,
    },
    Result {
        result: Option<String>,
        session_id: Option<String>,
        is_error: Option<bool>,
        cost_usd: Option<f64>,
        total_cost_usd: Option<f64>,
        num_turns: Option<u64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Turn {
    content: Option<Vec<Block>>,
}

/// Content block inside an assistant turn. Tool calls and their results are
/// tagged kinds we have no use for, hence `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// What the engine gets back from one run's worth of stream lines.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub output: String,
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub num_turns: i64,
    pub is_error: bool,
}

/// Fold a whole NDJSON stream into a [`StreamSummary`].
///
/// Unparseable lines are skipped rather than failing the run: the agent
/// interleaves diagnostics with JSON when it is killed mid-write. When the
/// stream ends without a usable `result` line (crash, kill, truncation), the
/// concatenated assistant text stands in for the output and the turn count
/// falls back to the number of assistant lines seen.
pub fn parse_stream(data: &str) -> StreamSummary {
    let mut summary = StreamSummary::default();
    let mut transcript = String::new();
    let mut assistant_lines = 0i64;

    for line in data.lines().filter(|l| !l.is_empty()) {
        let Ok(parsed) = serde_json::from_str::<StreamLine>(line) else {
            continue;
        };
        match parsed {
            StreamLine::System { session_id } => {
                if session_id.is_some() {
                    summary.session_id = session_id;
                }
            }
            StreamLine::Assistant { message } => {
                assistant_lines += 1;
                let blocks = message.and_then(|m| m.content).unwrap_or_default();
                for block in blocks {
                    if let Block::Text { text } = block {
                        if !transcript.is_empty() {
                            transcript.push('\n');
                        }
                        transcript.push_str(&text);
                    }
                }
            }
            StreamLine::Result {
                result,
                session_id,
                is_error,
                cost_usd,
                total_cost_usd,
                num_turns,
            } => {
                if session_id.is_some() {
                    summary.session_id = session_id;
                }
                if let Some(text) = result {
                    summary.output = text;
                }
                // Newer CLI versions report total_cost_usd; older ones the
                // unprefixed field.
                summary.cost_usd = total_cost_usd.or(cost_usd).unwrap_or(0.0);
                summary.num_turns = num_turns.map(|n| n as i64).unwrap_or(0);
                summary.is_error = is_error.unwrap_or(false);
            }
            StreamLine::Other => {}
        }
    }

    if summary.output.is_empty() {
        summary.output = transcript;
    }
    if summary.num_turns == 0 {
        summary.num_turns = assistant_lines;
    }
    summary
}
