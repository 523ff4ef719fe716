use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use weave_core::ids::{InvocationId, TurnId};
use weave_core::turns::{Role, Turn};

/// Why a turn was removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// A tool turn whose invocation id is not in the open set.
    OrphanedToolTurn,
    /// A merged user turn whose carried invocation ids match nothing open.
    UnmatchedCarriedResult,
}

#[derive(Clone, Debug)]
pub struct DroppedTurn {
    pub turn_id: TurnId,
    pub invocation_id: Option<InvocationId>,
    pub reason: DropReason,
}

/// Result of one filter pass. The filter never mutates its input; drops
/// and flags are reported for the caller to record.
#[derive(Clone, Debug)]
pub struct FilterReport {
    pub turns: Vec<Turn>,
    pub dropped: Vec<DroppedTurn>,
    pub flagged: Vec<TurnId>,
    /// Invocations opened by an assistant turn that never received a
    /// result within the sequence.
    pub unanswered: Vec<InvocationId>,
    /// Filtering would have removed every non-system turn; the original
    /// sequence was returned instead.
    pub degraded: bool,
}

/// Scans a turn sequence and removes turns that would violate the
/// provider's invocation/outcome pairing contract.
///
/// Applied both before compression (cheap rejection of obvious orphans)
/// and after cache packing (to catch violations the earlier stages
/// introduced).
pub struct CompatibilityFilter;

impl CompatibilityFilter {
    pub fn filter(turns: &[Turn]) -> FilterReport {
        let mut kept: Vec<Turn> = Vec::with_capacity(turns.len());
        let mut dropped: Vec<DroppedTurn> = Vec::new();
        let mut flagged: Vec<TurnId> = Vec::new();
        let mut open: HashSet<InvocationId> = HashSet::new();

        for turn in turns {
            // Packed history is validated conversation state. It is kept
            // unconditionally; re-validating its rendered text would
            // produce both false positives and false negatives.
            if turn.is_packed() {
                kept.push(turn.clone());
                continue;
            }

            match turn.role {
                Role::System => kept.push(turn.clone()),

                Role::Assistant => {
                    // Each assistant turn replaces the open set, answered
                    // or not.
                    open = turn.invocations.iter().map(|inv| inv.id.clone()).collect();
                    kept.push(turn.clone());
                }

                Role::Tool => {
                    let answered = turn
                        .invocation_id
                        .as_ref()
                        .map(|id| open.remove(id))
                        .unwrap_or(false);
                    if answered {
                        kept.push(turn.clone());
                    } else {
                        warn!(
                            turn_id = turn.id.as_str(),
                            invocation_id = turn.invocation_id.as_ref().map(|i| i.as_str()),
                            "dropping orphaned tool turn"
                        );
                        dropped.push(DroppedTurn {
                            turn_id: turn.id.clone(),
                            invocation_id: turn.invocation_id.clone(),
                            reason: DropReason::OrphanedToolTurn,
                        });
                    }
                }

                Role::User => {
                    if !turn.metadata.carried_invocations.is_empty() {
                        // A compression merge rewrote tool outcomes into
                        // this turn; its carried ids stand in for the
                        // merged tool turns.
                        let matched: Vec<&InvocationId> = turn
                            .metadata
                            .carried_invocations
                            .iter()
                            .filter(|id| open.contains(*id))
                            .collect();
                        if matched.is_empty() {
                            warn!(
                                turn_id = turn.id.as_str(),
                                "dropping merged turn with unmatched tool results"
                            );
                            dropped.push(DroppedTurn {
                                turn_id: turn.id.clone(),
                                invocation_id: turn.metadata.carried_invocations.first().cloned(),
                                reason: DropReason::UnmatchedCarriedResult,
                            });
                        } else {
                            for id in matched {
                                open.remove(id);
                            }
                            kept.push(turn.clone());
                        }
                    } else if looks_like_tool_result(&turn.text_content()) {
                        // Heuristic hit with no metadata to verify it
                        // against: keep, but flag for observability.
                        debug!(turn_id = turn.id.as_str(), "flagging tool-shaped user turn");
                        flagged.push(turn.id.clone());
                        kept.push(turn.clone());
                    } else {
                        kept.push(turn.clone());
                    }
                }
            }
        }

        let had_non_system = turns.iter().any(|t| t.role != Role::System);
        let kept_non_system = kept.iter().any(|t| t.role != Role::System);

        // Safety net: an empty non-system sequence is never sent onward.
        if had_non_system && !kept_non_system {
            warn!("filter removed every non-system turn; returning unfiltered sequence");
            return FilterReport {
                turns: turns.to_vec(),
                dropped,
                flagged,
                unanswered: open.into_iter().collect(),
                degraded: true,
            };
        }

        FilterReport {
            turns: kept,
            dropped,
            flagged,
            unanswered: open.into_iter().collect(),
            degraded: false,
        }
    }
}

/// Conservative detection of tool-result text embedded in a user turn —
/// only shapes that clearly came from a rewritten tool outcome, never
/// ordinary prose that happens to mention tools.
fn looks_like_tool_result(text: &str) -> bool {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)^\s*Tool:\s*\{",
            r#""tool_result"\s*:"#,
            r#""tool_execution"\s*:"#,
            r#""invocation_id"\s*:\s*""#,
            r"(?i)\[tool output truncated",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    if text.trim().is_empty() {
        return false;
    }
    patterns.iter().any(|re| re.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weave_core::turns::{Invocation, ToolOutcome};

    fn invocation(id: &str) -> Invocation {
        Invocation {
            id: InvocationId::from_raw(id),
            tool_name: "web_search".into(),
            arguments: json!({"query": "q"}),
        }
    }

    fn tool_turn(id: &str) -> Turn {
        Turn::tool_outcome(&ToolOutcome::ok(InvocationId::from_raw(id), json!("ok")))
    }

    #[test]
    fn matched_pair_is_kept() {
        let turns = vec![
            Turn::user_text("q"),
            Turn::assistant("calling", vec![invocation("call_1")]),
            tool_turn("call_1"),
        ];
        let report = CompatibilityFilter::filter(&turns);
        assert_eq!(report.turns, turns);
        assert!(report.dropped.is_empty());
        assert!(report.unanswered.is_empty());
        assert!(!report.degraded);
    }

    #[test]
    fn orphaned_tool_turn_is_dropped_and_recorded() {
        let turns = vec![Turn::user_text("q"), tool_turn("call_ghost")];
        let report = CompatibilityFilter::filter(&turns);

        assert_eq!(report.turns.len(), 1);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].reason, DropReason::OrphanedToolTurn);
        assert_eq!(
            report.dropped[0].invocation_id.as_ref().unwrap().as_str(),
            "call_ghost"
        );
    }

    #[test]
    fn open_set_resets_on_each_assistant_turn() {
        let turns = vec![
            Turn::assistant("first", vec![invocation("call_1")]),
            Turn::assistant("second", vec![invocation("call_2")]),
            // call_1 was superseded; its late result is orphaned.
            tool_turn("call_1"),
            tool_turn("call_2"),
        ];
        let report = CompatibilityFilter::filter(&turns);
        assert_eq!(report.turns.len(), 3);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(
            report.dropped[0].invocation_id.as_ref().unwrap().as_str(),
            "call_1"
        );
    }

    #[test]
    fn duplicate_result_for_same_invocation_dropped() {
        let turns = vec![
            Turn::assistant("calling", vec![invocation("call_1")]),
            tool_turn("call_1"),
            tool_turn("call_1"),
        ];
        let report = CompatibilityFilter::filter(&turns);
        assert_eq!(report.turns.len(), 2);
        assert_eq!(report.dropped.len(), 1);
    }

    #[test]
    fn packed_turns_bypass_every_rule() {
        let mut packed = Turn::user_text(r#"Tool: {"tool_result": "old"}"#);
        packed.metadata.packed = true;
        packed.metadata.carried_invocations = vec![InvocationId::from_raw("call_ancient")];

        let turns = vec![packed.clone(), Turn::user_text("fresh question")];
        let report = CompatibilityFilter::filter(&turns);

        assert_eq!(report.turns.len(), 2);
        assert_eq!(report.turns[0], packed);
        assert!(report.dropped.is_empty());
        assert!(report.flagged.is_empty());
    }

    #[test]
    fn merged_turn_with_open_carried_id_is_kept() {
        let mut merged = Turn::user_text("User: q\n\nTool: result");
        merged.metadata.compressed = true;
        merged.metadata.carried_invocations = vec![InvocationId::from_raw("call_1")];

        let turns = vec![
            Turn::assistant("calling", vec![invocation("call_1")]),
            merged,
        ];
        let report = CompatibilityFilter::filter(&turns);
        assert_eq!(report.turns.len(), 2);
        assert!(report.dropped.is_empty());
        // The carried id consumed the open invocation.
        assert!(report.unanswered.is_empty());
    }

    #[test]
    fn merged_turn_with_stale_carried_ids_is_dropped() {
        let mut merged = Turn::user_text("User: q\n\nTool: result");
        merged.metadata.compressed = true;
        merged.metadata.carried_invocations = vec![InvocationId::from_raw("call_stale")];

        let turns = vec![Turn::user_text("hello"), merged];
        let report = CompatibilityFilter::filter(&turns);
        assert_eq!(report.turns.len(), 1);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].reason, DropReason::UnmatchedCarriedResult);
    }

    #[test]
    fn tool_shaped_text_without_metadata_kept_but_flagged() {
        let suspicious = Turn::user_text(r#"Tool: {"answer": 42}"#);
        let turns = vec![Turn::user_text("hi"), suspicious.clone()];
        let report = CompatibilityFilter::filter(&turns);

        assert_eq!(report.turns.len(), 2);
        assert_eq!(report.flagged, vec![suspicious.id]);
    }

    #[test]
    fn ordinary_prose_mentioning_tools_not_flagged() {
        let turns = vec![Turn::user_text(
            "What tool should I use to search the web? The tool_choice matters.",
        )];
        let report = CompatibilityFilter::filter(&turns);
        assert!(report.flagged.is_empty());
        assert_eq!(report.turns.len(), 1);
    }

    #[test]
    fn truncation_marker_is_flagged() {
        let turns = vec![
            Turn::user_text("hi"),
            Turn::user_text("partial output\n[tool output truncated: 9000 -> 2048 bytes]"),
        ];
        let report = CompatibilityFilter::filter(&turns);
        assert_eq!(report.flagged.len(), 1);
    }

    #[test]
    fn safety_net_returns_original_when_all_would_drop() {
        let turns = vec![Turn::system("rules"), tool_turn("call_ghost")];
        let report = CompatibilityFilter::filter(&turns);

        assert!(report.degraded);
        assert_eq!(report.turns, turns);
        // The drop is still recorded for observability.
        assert_eq!(report.dropped.len(), 1);
    }

    #[test]
    fn filter_is_idempotent() {
        let mut merged = Turn::user_text("Tool: stale");
        merged.metadata.carried_invocations = vec![InvocationId::from_raw("call_stale")];

        let turns = vec![
            Turn::user_text("q"),
            Turn::assistant("a", vec![invocation("call_1")]),
            tool_turn("call_1"),
            tool_turn("call_orphan"),
            merged,
        ];

        let once = CompatibilityFilter::filter(&turns);
        let twice = CompatibilityFilter::filter(&once.turns);
        assert_eq!(once.turns, twice.turns);
        assert!(twice.dropped.is_empty());
    }

    #[test]
    fn unanswered_invocations_reported() {
        let turns = vec![Turn::assistant("calling", vec![invocation("call_1")])];
        let report = CompatibilityFilter::filter(&turns);
        assert_eq!(report.unanswered, vec![InvocationId::from_raw("call_1")]);
    }

    #[test]
    fn invocation_metadata_survives_compress_pack_filter() {
        use crate::compress::{CompressorConfig, ContextCompressor};
        use crate::pack::{CacheBlockPacker, PackerConfig};

        // Old tool exchange that compression will merge and packing will
        // fold into a cache block; the filter must then keep the block
        // with the carried invocation id intact.
        let mut turns = vec![
            Turn::user_text("old question ".repeat(100)),
            Turn::assistant("calling", vec![invocation("call_old")]),
            tool_turn("call_old"),
        ];
        for i in 0..6 {
            turns.push(Turn::user_text(format!("q{i}")));
            turns.push(Turn::assistant(format!("a{i}"), vec![]));
        }

        let compressor = ContextCompressor::new(CompressorConfig {
            keep_recent_user: 2,
            keep_recent_assistant: 2,
            max_tool_output: 64,
        });
        let packer = CacheBlockPacker::new(PackerConfig {
            min_prefix: 1,
            block_size: 1,
            keep_tail: 2,
        });

        let compressed = compressor.compress(&turns, 100);
        let packed = packer.pack(&compressed);
        let report = CompatibilityFilter::filter(&packed);

        assert!(!report.degraded);
        let carrier = report
            .turns
            .iter()
            .find(|t| {
                t.metadata
                    .carried_invocations
                    .contains(&InvocationId::from_raw("call_old"))
            })
            .expect("carried invocation id lost in the pipeline");
        assert!(carrier.is_packed());
    }

    #[test]
    fn filter_never_empties_non_system_input() {
        // For any input with a non-system turn, the output keeps at
        // least one.
        let sequences = vec![
            vec![tool_turn("call_a")],
            vec![Turn::system("s"), tool_turn("call_a"), tool_turn("call_b")],
            vec![Turn::user_text("hi")],
        ];
        for turns in sequences {
            let report = CompatibilityFilter::filter(&turns);
            let non_system = report.turns.iter().any(|t| t.role != Role::System);
            assert!(non_system, "filter emptied: {turns:?}");
        }
    }
}
