use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::{now_millis, FeedbackPayload, RelayMessage};

/// Categories the periodic broadcast picks from.
pub const PERIODIC_CATEGORIES: [&str; 4] = ["push-ups", "bicep-curls", "lateral-raises", "squats"];

const FALLBACK_PHRASE: &str = "Keep up the good work!";

const PUSH_UPS: [&str; 7] = [
    "Excellent push-up form!",
    "Keep your body straight",
    "Lower your body more",
    "Keep elbows close to body",
    "Maintain shoulder alignment",
    "Control the movement",
    "Poor form detected - reset position",
];

const BICEP_CURLS: [&str; 7] = [
    "Perfect curl form!",
    "Keep shoulders stable",
    "Curl the weights up more",
    "Keep elbows at sides",
    "Control the movement",
    "Don't swing the weights",
    "Poor form detected - reset position",
];

const LATERAL_RAISES: [&str; 7] = [
    "Perfect shoulder height!",
    "Keep slight elbow bend",
    "Raise arms to shoulder level",
    "Keep shoulders level",
    "Control the movement",
    "Don't raise too high",
    "Poor form detected - reset position",
];

const SQUATS: [&str; 7] = [
    "Perfect squat form!",
    "Keep chest up",
    "Lower your body more",
    "Keep knees behind toes",
    "Keep your back straight",
    "Control the movement",
    "Poor form detected - reset position",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Good,
    Warning,
    Error,
}

impl Severity {
    pub fn for_phrase_index(index: usize) -> Self {
        if index >= 6 {
            Severity::Error
        } else if index >= 4 {
            Severity::Warning
        } else {
            Severity::Good
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub phrase: &'static str,
    /// Computed for logging; devices only receive the phrase.
    pub severity: Severity,
}

impl Feedback {
    pub fn into_message(self) -> RelayMessage {
        RelayMessage::AiFeedback(FeedbackPayload {
            timestamp: now_millis(),
            feedback: self.phrase.to_string(),
        })
    }
}

pub fn phrases_for(category: &str) -> Option<&'static [&'static str; 7]> {
    match category {
        "push-ups" => Some(&PUSH_UPS),
        "bicep-curls" => Some(&BICEP_CURLS),
        "lateral-raises" => Some(&LATERAL_RAISES),
        "squats" => Some(&SQUATS),
        _ => None,
    }
}

/// Pick a phrase for `category`. Unknown categories always get the generic
/// encouragement.
pub fn synthesize<R: Rng + ?Sized>(category: &str, rng: &mut R) -> Feedback {
    let index = rng.gen_range(0..7);
    let severity = Severity::for_phrase_index(index);
    let phrase = match phrases_for(category) {
        Some(phrases) => phrases[index % phrases.len()],
        None => FALLBACK_PHRASE,
    };
    Feedback { phrase, severity }
}

pub fn random_category<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    PERIODIC_CATEGORIES
        .choose(rng)
        .copied()
        .unwrap_or(PERIODIC_CATEGORIES[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test_timeout::timeout]
    fn severity_thresholds() {
        assert_eq!(Severity::for_phrase_index(0), Severity::Good);
        assert_eq!(Severity::for_phrase_index(3), Severity::Good);
        assert_eq!(Severity::for_phrase_index(4), Severity::Warning);
        assert_eq!(Severity::for_phrase_index(5), Severity::Warning);
        assert_eq!(Severity::for_phrase_index(6), Severity::Error);
    }

    #[test_timeout::timeout]
    fn phrases_come_from_the_category_table() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let feedback = synthesize("squats", &mut rng);
            let index = SQUATS
                .iter()
                .position(|p| *p == feedback.phrase)
                .expect("squat phrase");
            assert_eq!(feedback.severity, Severity::for_phrase_index(index));
        }
    }

    #[test_timeout::timeout]
    fn unknown_category_falls_back() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(synthesize("Hr Only", &mut rng).phrase, FALLBACK_PHRASE);
        assert_eq!(synthesize("", &mut rng).phrase, FALLBACK_PHRASE);
    }

    #[test_timeout::timeout]
    fn random_category_is_known() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            assert!(phrases_for(random_category(&mut rng)).is_some());
        }
    }

    #[test_timeout::timeout]
    fn feedback_message_carries_only_the_phrase() {
        let message = Feedback {
            phrase: "Keep chest up",
            severity: Severity::Good,
        }
        .into_message();
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "ai_feedback");
        assert_eq!(value["payload"]["feedback"], "Keep chest up");
        assert!(value["payload"].get("severity").is_none());
    }
}
