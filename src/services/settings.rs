use crate::config::{RecognitionConfig, RetentionConfig};
use crate::db::repositories::settings::SettingsRepository;
use crate::error::Error;
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

const QUALITY_THRESHOLD_KEY: &str = "quality_threshold";
const RETENTION_KEY: &str = "retention";

/// Hour thresholds of the retention sweep; 0 disables a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSettings {
    pub matched_event_hours: u32,
    pub unmatched_event_hours: u32,
    pub matched_full_frame_hours: u32,
    pub unmatched_full_frame_hours: u32,
}

impl From<&RetentionConfig> for RetentionSettings {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            matched_event_hours: config.matched_event_hours,
            unmatched_event_hours: config.unmatched_event_hours,
            matched_full_frame_hours: config.matched_full_frame_hours,
            unmatched_full_frame_hours: config.unmatched_full_frame_hours,
        }
    }
}

/// Settings adjustable through the API. Reads are served from memory,
/// writes go to the settings table first.
pub struct RuntimeSettings {
    repo: SettingsRepository,
    quality_threshold: RwLock<f32>,
    retention: RwLock<RetentionSettings>,
}

impl RuntimeSettings {
    /// Load persisted values, falling back to the configured defaults
    pub async fn load(
        repo: SettingsRepository,
        recognition: &RecognitionConfig,
        retention: &RetentionConfig,
    ) -> Result<Self> {
        let quality_threshold = repo
            .get::<f32>(QUALITY_THRESHOLD_KEY)
            .await?
            .unwrap_or(recognition.quality_threshold);
        let retention = repo
            .get::<RetentionSettings>(RETENTION_KEY)
            .await?
            .unwrap_or_else(|| RetentionSettings::from(retention));

        info!(
            "Runtime settings: quality threshold {:.2}, retention {:?}",
            quality_threshold, retention
        );

        Ok(Self {
            repo,
            quality_threshold: RwLock::new(quality_threshold),
            retention: RwLock::new(retention),
        })
    }

    pub fn quality_threshold(&self) -> f32 {
        match self.quality_threshold.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub async fn set_quality_threshold(&self, threshold: f32) -> Result<f32> {
        if !(0.0..=1.0).contains(&threshold) || threshold.is_nan() {
            return Err(Error::Validation(format!(
                "Quality threshold must be between 0 and 1, got {}",
                threshold
            ))
            .into());
        }

        self.repo.put(QUALITY_THRESHOLD_KEY, &threshold).await?;
        match self.quality_threshold.write() {
            Ok(mut guard) => *guard = threshold,
            Err(poisoned) => *poisoned.into_inner() = threshold,
        }
        info!("Quality threshold set to {:.2}", threshold);
        Ok(threshold)
    }

    pub fn retention(&self) -> RetentionSettings {
        match self.retention.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub async fn set_retention(&self, retention: RetentionSettings) -> Result<RetentionSettings> {
        self.repo.put(RETENTION_KEY, &retention).await?;
        match self.retention.write() {
            Ok(mut guard) => *guard = retention,
            Err(poisoned) => *poisoned.into_inner() = retention,
        }
        info!("Retention settings updated: {:?}", retention);
        Ok(retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::error::domain_error;
    use std::sync::Arc;

    #[tokio::test]
    async fn defaults_then_persisted_values() {
        let repo = SettingsRepository::new(Arc::new(test_pool().await));
        let settings = RuntimeSettings::load(
            repo.clone(),
            &RecognitionConfig::default(),
            &RetentionConfig::default(),
        )
        .await
        .unwrap();
        assert!((settings.quality_threshold() - 0.4).abs() < f32::EPSILON);
        assert_eq!(settings.retention().matched_event_hours, 720);

        settings.set_quality_threshold(0.65).await.unwrap();
        let mut retention = settings.retention();
        retention.unmatched_full_frame_hours = 0;
        settings.set_retention(retention).await.unwrap();

        let reloaded = RuntimeSettings::load(
            repo,
            &RecognitionConfig::default(),
            &RetentionConfig::default(),
        )
        .await
        .unwrap();
        assert!((reloaded.quality_threshold() - 0.65).abs() < f32::EPSILON);
        assert_eq!(reloaded.retention().unmatched_full_frame_hours, 0);
    }

    #[tokio::test]
    async fn out_of_range_threshold_is_rejected() {
        let repo = SettingsRepository::new(Arc::new(test_pool().await));
        let settings = RuntimeSettings::load(
            repo,
            &RecognitionConfig::default(),
            &RetentionConfig::default(),
        )
        .await
        .unwrap();

        let err = settings.set_quality_threshold(1.5).await.unwrap_err();
        assert!(matches!(domain_error(&err), Some(Error::Validation(_))));
        assert!((settings.quality_threshold() - 0.4).abs() < f32::EPSILON);
    }
}
