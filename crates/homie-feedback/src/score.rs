//! Outcome scoring: how well did a sent message land.

/// Inputs for one row's score.
#[derive(Debug, Clone, Default)]
pub struct FeedbackSignals {
    pub is_group: bool,
    pub time_to_first_response_ms: Option<i64>,
    pub response_count: u32,
    pub reaction_count: u32,
    pub negative_reaction_count: u32,
    pub reaction_net_score: i32,
    pub outgoing_ends_with_question: bool,
    /// First reply text when it reads as a correction ("Actually…").
    pub refinement: Option<String>,
}

const FAST_REPLY_MS: i64 = 60_000;
const OK_REPLY_MS: i64 = 5 * 60_000;

/// Score in roughly [-1.5, 1.0]. Positive = the message landed.
pub fn score_feedback(s: &FeedbackSignals) -> f64 {
    let mut score = 0.0;

    match s.time_to_first_response_ms {
        Some(ms) if ms <= FAST_REPLY_MS => score += 0.3,
        Some(ms) if ms <= OK_REPLY_MS => score += 0.15,
        Some(_) => score += 0.05,
        None => {
            // A question that got no response is a miss; silence after a
            // statement is normal, especially in groups.
            if s.outgoing_ends_with_question {
                score -= 0.2;
            } else if !s.is_group {
                score -= 0.05;
            }
        }
    }

    if s.response_count > 1 {
        score += (0.1 * (s.response_count - 1) as f64).min(0.3);
    }

    if s.reaction_net_score > 0 {
        score += (0.2 * s.reaction_net_score as f64).min(0.4);
    }
    if s.negative_reaction_count > 0 {
        score -= (0.5 * s.negative_reaction_count as f64).min(1.0);
    }

    if s.refinement.is_some() {
        score -= 0.2;
    }

    score
}

/// Detect a correction-style first reply.
pub fn detect_refinement(reply: &str) -> bool {
    let trimmed = reply.trim_start();
    const PREFIXES: &[&str] = &["Actually", "No,", "I meant", "not what I"];
    PREFIXES.iter().any(|p| trimmed.starts_with(p))
        || trimmed.to_lowercase().contains("not what i")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_reply_scores_positive() {
        let score = score_feedback(&FeedbackSignals {
            time_to_first_response_ms: Some(10_000),
            response_count: 1,
            ..Default::default()
        });
        assert!(score > 0.0);
    }

    #[test]
    fn unanswered_question_scores_negative() {
        let score = score_feedback(&FeedbackSignals {
            outgoing_ends_with_question: true,
            ..Default::default()
        });
        assert!(score < 0.0);
    }

    #[test]
    fn unanswered_statement_in_group_is_neutral() {
        let score = score_feedback(&FeedbackSignals {
            is_group: true,
            ..Default::default()
        });
        assert_eq!(score, 0.0);
    }

    #[test]
    fn negative_reactions_dominate() {
        let score = score_feedback(&FeedbackSignals {
            time_to_first_response_ms: Some(5_000),
            response_count: 1,
            reaction_count: 2,
            negative_reaction_count: 2,
            reaction_net_score: -2,
            ..Default::default()
        });
        assert!(score < -0.4);
    }

    #[test]
    fn refinement_penalty_applies() {
        let base = FeedbackSignals {
            time_to_first_response_ms: Some(5_000),
            response_count: 1,
            ..Default::default()
        };
        let with = FeedbackSignals {
            refinement: Some("Actually I meant tomorrow".into()),
            ..base.clone()
        };
        assert!(score_feedback(&with) < score_feedback(&base));
    }

    #[test]
    fn refinement_detection() {
        assert!(detect_refinement("Actually, I meant Friday"));
        assert!(detect_refinement("No, the other one"));
        assert!(detect_refinement("  I meant the blue one"));
        assert!(detect_refinement("that's not what i said"));
        assert!(!detect_refinement("sounds good!"));
    }
}
