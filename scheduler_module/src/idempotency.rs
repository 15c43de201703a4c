//! Deterministic keys guarding against scheduling the same step twice.
//!
//! A key is `prospectId:sequenceId:stepNumber`. The `scheduled_emails` table
//! enforces uniqueness on it, so two overlapping scheduler runs resolve to a
//! single row.

const SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyKeyError {
    #[error("prospect id is required")]
    EmptyProspectId,
    #[error("sequence id is required")]
    EmptySequenceId,
    #[error("step number must be a positive integer, got {0}")]
    InvalidStepNumber(String),
    #[error("invalid idempotency key '{0}': expected prospectId:sequenceId:stepNumber")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKeyParts {
    pub prospect_id: String,
    pub sequence_id: String,
    pub step_number: u32,
}

pub fn generate(
    prospect_id: &str,
    sequence_id: &str,
    step_number: u32,
) -> Result<String, IdempotencyKeyError> {
    if prospect_id.trim().is_empty() {
        return Err(IdempotencyKeyError::EmptyProspectId);
    }
    if sequence_id.trim().is_empty() {
        return Err(IdempotencyKeyError::EmptySequenceId);
    }
    if step_number < 1 {
        return Err(IdempotencyKeyError::InvalidStepNumber(
            step_number.to_string(),
        ));
    }
    Ok(format!(
        "{}{sep}{}{sep}{}",
        prospect_id,
        sequence_id,
        step_number,
        sep = SEPARATOR
    ))
}

pub fn parse(key: &str) -> Result<IdempotencyKeyParts, IdempotencyKeyError> {
    let parts: Vec<&str> = key.split(SEPARATOR).collect();
    if key.is_empty() || parts.len() != 3 || parts.iter().any(|part| part.is_empty()) {
        return Err(IdempotencyKeyError::Malformed(key.to_string()));
    }
    let step_number = parts[2]
        .parse::<u32>()
        .ok()
        .filter(|step| *step >= 1)
        .ok_or_else(|| IdempotencyKeyError::InvalidStepNumber(parts[2].to_string()))?;
    Ok(IdempotencyKeyParts {
        prospect_id: parts[0].to_string(),
        sequence_id: parts[1].to_string(),
        step_number,
    })
}

pub fn is_valid(key: &str) -> bool {
    parse(key).is_ok()
}

/// Suffix appended to a key when its row is cancelled by a stop, freeing the
/// original key for a later enrollment.
pub fn cancelled_key(key: &str, cancelled_by: &str) -> String {
    format!("{}::CANCELLED::{}", key, cancelled_by)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_parse_returns_inputs() {
        let cases = [
            ("prospect-1", "sequence-1", 1),
            ("c1a2b3", "seq_42", 3),
            ("018f3c9e-1d2b-7a4e", "0f0e-aa", 12),
        ];
        for (prospect, sequence, step) in cases {
            let key = generate(prospect, sequence, step).expect("valid key");
            let parts = parse(&key).expect("parse key");
            assert_eq!(parts.prospect_id, prospect);
            assert_eq!(parts.sequence_id, sequence);
            assert_eq!(parts.step_number, step);
        }
    }

    #[test]
    fn keys_differ_when_any_input_differs() {
        let base = generate("p1", "s1", 1).unwrap();
        assert_eq!(base, "p1:s1:1");
        assert_eq!(base, generate("p1", "s1", 1).unwrap());
        assert_ne!(base, generate("p2", "s1", 1).unwrap());
        assert_ne!(base, generate("p1", "s2", 1).unwrap());
        assert_ne!(base, generate("p1", "s1", 2).unwrap());
    }

    #[test]
    fn generate_rejects_blank_ids_and_step_zero() {
        assert_eq!(
            generate("  ", "s1", 1),
            Err(IdempotencyKeyError::EmptyProspectId)
        );
        assert_eq!(generate("p1", "", 1), Err(IdempotencyKeyError::EmptySequenceId));
        assert!(matches!(
            generate("p1", "s1", 0),
            Err(IdempotencyKeyError::InvalidStepNumber(_))
        ));
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        for key in ["", "p1:s1", "p1:s1:1:extra", ":s1:1", "p1::1", "p1:s1:"] {
            assert!(!is_valid(key), "{key} should be invalid");
        }
        assert!(matches!(
            parse("p1:s1:zero"),
            Err(IdempotencyKeyError::InvalidStepNumber(_))
        ));
        assert!(matches!(
            parse("p1:s1:0"),
            Err(IdempotencyKeyError::InvalidStepNumber(_))
        ));
        assert!(matches!(
            parse("p1:s1:-2"),
            Err(IdempotencyKeyError::InvalidStepNumber(_))
        ));
    }

    #[test]
    fn cancelled_key_is_no_longer_a_valid_key() {
        let key = cancelled_key("p1:s1:2", "campaign-9");
        assert_eq!(key, "p1:s1:2::CANCELLED::campaign-9");
        assert!(!is_valid(&key));
    }
}
