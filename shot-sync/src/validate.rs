//! Health check for the legacy `shots.json` payload

use crate::config::RetryPolicy;
use crate::error::SyncResult;
use crate::models::ValidationResult;
use crate::retry::{retry_until, Attempt, CancelSignal};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Checks a legacy `{"version": N, "shots": [...]}` file
///
/// A missing file is re-checked according to `absence_retry` since it may
/// still be propagating. The only error is cancellation.
pub async fn validate_json(
    path: &Path,
    absence_retry: &RetryPolicy,
    max_shots: usize,
    cancel: &CancelSignal,
) -> SyncResult<ValidationResult> {
    let outcome = retry_until(absence_retry, cancel, |_| {
        let result = check_once(path, max_shots);
        std::future::ready(Ok(if result == ValidationResult::Missing {
            Attempt::Retry(result)
        } else {
            Attempt::Done(result)
        }))
    })
    .await?;

    if outcome.value != ValidationResult::Valid {
        log::warn!(
            "Validation of {} after {} attempt(s): {:?}",
            path.display(),
            outcome.attempts,
            outcome.value
        );
    }
    Ok(outcome.value)
}

fn check_once(path: &Path, max_shots: usize) -> ValidationResult {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return ValidationResult::Missing,
        Err(e) => {
            log::warn!("Cannot read {}: {}", path.display(), e);
            return ValidationResult::Corrupt;
        }
    };

    if content.trim().is_empty() {
        return ValidationResult::Empty;
    }

    let root: Value = match serde_json::from_str(&content) {
        Ok(root) => root,
        Err(e) => {
            log::debug!("{} is not valid JSON: {}", path.display(), e);
            return ValidationResult::Corrupt;
        }
    };

    let Some(object) = root.as_object() else {
        return ValidationResult::Corrupt;
    };
    let (Some(_version), Some(shots)) = (object.get("version"), object.get("shots")) else {
        return ValidationResult::VersionMismatch;
    };

    match shots.as_array() {
        Some(shots) if shots.len() <= max_shots => ValidationResult::Valid,
        Some(shots) => {
            log::warn!(
                "{} lists {} shots (limit {}), treating as corrupt",
                path.display(),
                shots.len(),
                max_shots
            );
            ValidationResult::Corrupt
        }
        None => ValidationResult::Corrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backoff;
    use std::time::Duration;
    use tempfile::TempDir;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            backoff: Backoff::Linear { step_ms: 5 },
        }
    }

    async fn check(content: Option<&str>, max_shots: usize) -> ValidationResult {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shots.json");
        if let Some(content) = content {
            fs::write(&path, content).unwrap();
        }
        validate_json(&path, &quick_retry(), max_shots, &CancelSignal::never())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_results() {
        assert_eq!(check(None, 10).await, ValidationResult::Missing);
        assert_eq!(check(Some("  \n"), 10).await, ValidationResult::Empty);
        assert_eq!(check(Some("{\"version\": 1,"), 10).await, ValidationResult::Corrupt);
        assert_eq!(check(Some("[1, 2]"), 10).await, ValidationResult::Corrupt);
        assert_eq!(check(Some(r#"{"shots": []}"#), 10).await, ValidationResult::VersionMismatch);
        assert_eq!(check(Some(r#"{"version": 2}"#), 10).await, ValidationResult::VersionMismatch);
        assert_eq!(
            check(Some(r#"{"version": 2, "shots": {}}"#), 10).await,
            ValidationResult::Corrupt
        );
        assert_eq!(
            check(Some(r#"{"version": 2, "shots": [{}, {}]}"#), 10).await,
            ValidationResult::Valid
        );
    }

    #[tokio::test]
    async fn test_oversized_shots_array_is_corrupt() {
        assert_eq!(
            check(Some(r#"{"version": 1, "shots": [1, 2, 3]}"#), 2).await,
            ValidationResult::Corrupt
        );
    }

    #[tokio::test]
    async fn test_file_appearing_during_retry_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shots.json");
        let writer_path = path.clone();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(8)).await;
            fs::write(writer_path, r#"{"version": 1, "shots": []}"#).unwrap();
        });

        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Backoff::Linear { step_ms: 5 },
        };
        let result = validate_json(&path, &policy, 10, &CancelSignal::never())
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(result, ValidationResult::Valid);
    }
}
