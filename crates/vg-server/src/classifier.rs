//! Content-sensitivity classification.
//!
//! [`KeywordClassifier`] is a placeholder heuristic: a case-insensitive
//! deny-list match over title and description, plus a seeded random flag at
//! `noise_rate` for otherwise clean input. A remote classifier would sit
//! behind the same [`SensitivityClassifier`] trait, so callers treat every
//! call as latent and retryable.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vg_core::config::ModerationConfig;
use vg_core::{Error, Result, SensitivityVerdict};

#[async_trait]
pub trait SensitivityClassifier: Send + Sync {
    /// Classify textual metadata. Never returns `Pending`.
    async fn classify(&self, title: &str, description: Option<&str>) -> Result<SensitivityVerdict>;
}

pub struct KeywordClassifier {
    deny_list: Vec<String>,
    noise_rate: f64,
    rng: Mutex<StdRng>,
}

impl KeywordClassifier {
    pub fn new(deny_list: impl IntoIterator<Item = impl AsRef<str>>, noise_rate: f64, rng: StdRng) -> Self {
        let deny_list = deny_list
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            deny_list,
            noise_rate: if noise_rate.is_finite() {
                noise_rate.clamp(0.0, 1.0)
            } else {
                0.0
            },
            rng: Mutex::new(rng),
        }
    }

    pub fn from_config(cfg: &ModerationConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::new(&cfg.deny_list, cfg.noise_rate, rng)
    }

    /// Whether `text` contains any deny-listed token, ignoring case.
    pub fn matches_deny_list(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.deny_list.iter().any(|token| text.contains(token.as_str()))
    }
}

impl std::fmt::Debug for KeywordClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeywordClassifier")
            .field("deny_list", &self.deny_list)
            .field("noise_rate", &self.noise_rate)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SensitivityClassifier for KeywordClassifier {
    async fn classify(&self, title: &str, description: Option<&str>) -> Result<SensitivityVerdict> {
        let text = format!("{title}\n{}", description.unwrap_or(""));
        if self.matches_deny_list(&text) {
            return Ok(SensitivityVerdict::Flagged);
        }
        let noisy = self.rng.lock().gen_bool(self.noise_rate);
        Ok(if noisy {
            SensitivityVerdict::Flagged
        } else {
            SensitivityVerdict::Safe
        })
    }
}

/// Call `classifier` up to `attempts` times with a short linear backoff.
pub async fn classify_with_retry(
    classifier: &dyn SensitivityClassifier,
    title: &str,
    description: Option<&str>,
    attempts: u32,
) -> Result<SensitivityVerdict> {
    let attempts = attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match classifier.classify(title, description).await {
            Ok(SensitivityVerdict::Pending) => {
                last_err = Some(Error::Internal("classifier returned no verdict".into()));
            }
            Ok(verdict) => return Ok(verdict),
            Err(e) => {
                tracing::warn!(attempt, attempts, "Classification attempt failed: {e}");
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Internal("classification failed".into())))
}
