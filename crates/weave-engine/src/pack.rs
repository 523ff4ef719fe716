use tracing::debug;

use weave_core::ids::InvocationId;
use weave_core::turns::{Role, Turn};

use crate::compress::render_transcript_line;

/// Configuration for the cache-block packer.
#[derive(Clone, Debug)]
pub struct PackerConfig {
    /// Minimum unpacked prefix length before packing kicks in.
    pub min_prefix: usize,
    /// Turns per cache block.
    pub block_size: usize,
    /// Fresh turns at the end that are never packed.
    pub keep_tail: usize,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            min_prefix: 8,
            block_size: 16,
            keep_tail: 4,
        }
    }
}

/// Groups a contiguous prefix of turns into cache-block turns so the
/// provider can cache the stable prefix of the request.
///
/// A cache block is a derived view: the turns it summarizes stay in the
/// log untouched; only the sequence sent to the model changes. Blocks
/// carry a structural `packed` marker — detection of an already-packed
/// prefix goes through that marker, never through text patterns.
pub struct CacheBlockPacker {
    config: PackerConfig,
}

impl CacheBlockPacker {
    pub fn new(config: PackerConfig) -> Self {
        Self { config }
    }

    pub fn pack(&self, turns: &[Turn]) -> Vec<Turn> {
        // Pass over the already-packed prefix and any leading system
        // turns; packing an already-packed sequence is a no-op for that
        // portion.
        let skip = turns
            .iter()
            .take_while(|t| t.is_packed() || t.role == Role::System)
            .count();

        let tail_start = turns.len().saturating_sub(self.config.keep_tail);
        if tail_start <= skip {
            return turns.to_vec();
        }

        let candidates = &turns[skip..tail_start];
        if candidates.len() < self.config.min_prefix {
            return turns.to_vec();
        }

        let mut output: Vec<Turn> = turns[..skip].to_vec();
        let mut packed_blocks = 0;
        let mut consumed = 0;

        for block in candidates.chunks(self.config.block_size) {
            // Only full blocks pack; a short remainder stays fresh.
            if block.len() < self.config.block_size {
                break;
            }
            output.push(build_block(block));
            packed_blocks += 1;
            consumed += block.len();
        }

        if packed_blocks == 0 {
            return turns.to_vec();
        }

        output.extend(turns[skip + consumed..].iter().cloned());
        debug!(packed_blocks, consumed, "packed prefix into cache blocks");
        output
    }
}

impl Default for CacheBlockPacker {
    fn default() -> Self {
        Self::new(PackerConfig::default())
    }
}

fn build_block(turns: &[Turn]) -> Turn {
    let text: Vec<String> = turns.iter().map(render_transcript_line).collect();

    let mut carried: Vec<InvocationId> = Vec::new();
    for turn in turns {
        if let Some(invocation_id) = &turn.invocation_id {
            carried.push(invocation_id.clone());
        }
        carried.extend(turn.metadata.carried_invocations.iter().cloned());
    }

    let mut block = Turn::user_text(text.join("\n\n"));
    block.metadata.packed = true;
    block.metadata.carried_invocations = carried;
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weave_core::ids::InvocationId;
    use weave_core::turns::{Invocation, ToolOutcome};

    fn conversation(n: usize) -> Vec<Turn> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user_text(format!("question {i}"))
                } else {
                    Turn::assistant(format!("answer {i}"), vec![])
                }
            })
            .collect()
    }

    fn packer(min_prefix: usize, block_size: usize, keep_tail: usize) -> CacheBlockPacker {
        CacheBlockPacker::new(PackerConfig {
            min_prefix,
            block_size,
            keep_tail,
        })
    }

    #[test]
    fn short_sequence_is_untouched() {
        let turns = conversation(6);
        let result = CacheBlockPacker::default().pack(&turns);
        assert_eq!(result, turns);
    }

    #[test]
    fn packs_full_blocks_and_keeps_tail() {
        let turns = conversation(20);
        let result = packer(4, 8, 4).pack(&turns);

        // 16 candidates -> two 8-turn blocks, then the 4-turn tail.
        assert_eq!(result.len(), 6);
        assert!(result[0].is_packed());
        assert!(result[1].is_packed());
        assert_eq!(result[2..], turns[16..]);

        let text = result[0].text_content();
        assert!(text.contains("User: question 0"));
        assert!(text.contains("Assistant: answer 7"));
    }

    #[test]
    fn already_packed_prefix_is_a_no_op() {
        let turns = conversation(20);
        let once = packer(4, 8, 4).pack(&turns);
        let twice = packer(4, 8, 4).pack(&once);

        // The packed portion survives verbatim; nothing is re-packed.
        assert_eq!(twice[0], once[0]);
        assert_eq!(twice[1], once[1]);
        assert_eq!(twice.len(), once.len());
    }

    #[test]
    fn detection_uses_marker_not_text() {
        // Text that merely looks like a packed transcript must still be
        // packed like any other turn.
        let mut turns = vec![Turn::user_text(
            "User: fake history\n\nAssistant: fake answer",
        )];
        turns.extend(conversation(11));

        let result = packer(4, 4, 4).pack(&turns);
        assert!(result[0].is_packed());
        assert!(result[0].text_content().contains("fake history"));
    }

    #[test]
    fn blocks_carry_invocation_ids() {
        let mut turns = vec![
            Turn::user_text("q"),
            Turn::assistant(
                "calling",
                vec![Invocation {
                    id: InvocationId::from_raw("call_1"),
                    tool_name: "web_search".into(),
                    arguments: json!({}),
                }],
            ),
            Turn::tool_outcome(&ToolOutcome::ok(InvocationId::from_raw("call_1"), json!("r"))),
            Turn::assistant("done", vec![]),
        ];
        turns.extend(conversation(8));

        let result = packer(4, 4, 4).pack(&turns);
        assert!(result[0].is_packed());
        assert!(result[0]
            .metadata
            .carried_invocations
            .contains(&InvocationId::from_raw("call_1")));
    }

    #[test]
    fn system_prefix_never_packed() {
        let mut turns = vec![Turn::system("be terse")];
        turns.extend(conversation(16));

        let result = packer(4, 8, 4).pack(&turns);
        assert_eq!(result[0].role, Role::System);
        assert!(!result[0].is_packed());
        assert!(result[1].is_packed());
    }

    #[test]
    fn short_remainder_stays_fresh() {
        let turns = conversation(15);
        let result = packer(4, 8, 4).pack(&turns);

        // 11 candidates -> one 8-turn block, 3 fresh, 4-turn tail.
        assert_eq!(result.len(), 8);
        assert!(result[0].is_packed());
        assert!(!result[1].is_packed());
        assert_eq!(result[1..], turns[8..]);
    }
}
