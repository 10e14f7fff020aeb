use crate::models::metric::TrainingSample;
use once_cell::sync::Lazy;
use regex::Regex;

// Trainers print free-form text; these patterns are the contract. Supporting a
// new framework means adding a pattern here, nothing else.
const NUM: &str = r"[-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?";

static LOSS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\b(val[_ ])?loss[:=\s]+({NUM})")).expect("invalid loss pattern"));

static ACCURACY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(val[_ ])?(?:accuracy|acc)[:=\s]+({NUM})")).expect("invalid accuracy pattern")
});

static LEARNING_RATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(?:learning[_ ]rate|lr)[:=\s]+({NUM})")).expect("invalid learning rate pattern")
});

static EPOCH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bepoch[:/ ]+([0-9]+)").expect("invalid epoch pattern"));

static STEP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:step|batch)[:/ ]+([0-9]+)").expect("invalid step pattern"));

/// Extracts training metrics from one log line. Pure and stateless; returns
/// None when no pattern captures anything. Numbers that fail to parse are
/// ignored silently.
pub fn parse_line(line: &str) -> Option<TrainingSample> {
    let mut sample = TrainingSample::default();

    if let Some(captures) = LOSS_PATTERN.captures(line) {
        let value = captures.get(2).and_then(|m| m.as_str().parse::<f64>().ok());
        match (captures.get(1), value) {
            (Some(_), Some(value)) => sample.val_loss = Some(value),
            (None, Some(value)) => sample.loss = Some(value),
            _ => {}
        }
    }

    if let Some(captures) = ACCURACY_PATTERN.captures(line) {
        let value = captures.get(2).and_then(|m| m.as_str().parse::<f64>().ok());
        match (captures.get(1), value) {
            (Some(_), Some(value)) => sample.val_accuracy = Some(value),
            (None, Some(value)) => sample.accuracy = Some(value),
            _ => {}
        }
    }

    if let Some(captures) = LEARNING_RATE_PATTERN.captures(line) {
        sample.learning_rate = captures.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
    }

    if let Some(captures) = EPOCH_PATTERN.captures(line) {
        sample.epoch = captures.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
    }

    if let Some(captures) = STEP_PATTERN.captures(line) {
        sample.step = captures.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
    }

    if sample.is_empty() {
        None
    } else {
        Some(sample)
    }
}
