use super::{ApiError, ApiResult};
use axum::extract::Multipart;
use bytes::Bytes;
use std::collections::HashMap;
use std::str::FromStr;

/// An uploaded file part
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub bytes: Bytes,
}

/// A multipart body split into text fields and file parts. Parts carrying
/// a file name are files; everything else is read as text.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    pub fields: HashMap<String, String>,
    pub files: HashMap<String, Upload>,
}

impl MultipartForm {
    pub async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = MultipartForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e)))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let bytes = field.bytes().await.map_err(|e| {
                        ApiError::bad_request(format!("Failed to read {}: {}", name, e))
                    })?;
                    if !bytes.is_empty() {
                        form.files.insert(
                            name,
                            Upload {
                                file_name: Some(file_name),
                                bytes,
                            },
                        );
                    }
                }
                None => {
                    let text = field.text().await.map_err(|e| {
                        ApiError::bad_request(format!("Failed to read {}: {}", name, e))
                    })?;
                    form.fields.insert(name, text);
                }
            }
        }

        Ok(form)
    }

    /// Trimmed, non-empty text field
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Parsed field, `default` when absent; unparseable values are rejected
    pub fn parse_or<T: FromStr>(&self, name: &str, default: T) -> ApiResult<T> {
        match self.text(name) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request(format!("Invalid {}: {}", name, raw))),
            None => Ok(default),
        }
    }

    pub fn parse_opt<T: FromStr>(&self, name: &str) -> ApiResult<Option<T>> {
        self.text(name)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| ApiError::bad_request(format!("Invalid {}: {}", name, raw)))
            })
            .transpose()
    }

    /// `true`, `1`, `yes` and `on` are true, anything else false
    pub fn flag(&self, name: &str, default: bool) -> bool {
        self.text(name)
            .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(default)
    }

    pub fn file(&self, name: &str) -> Option<&Upload> {
        self.files.get(name)
    }

    #[cfg(test)]
    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    #[cfg(test)]
    pub fn with_file(mut self, name: &str, file_name: &str, bytes: impl Into<Bytes>) -> Self {
        self.files.insert(
            name.to_string(),
            Upload {
                file_name: Some(file_name.to_string()),
                bytes: bytes.into(),
            },
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_parse_with_defaults() {
        let form = MultipartForm::default()
            .with_field("threshold", " 0.7 ")
            .with_field("fps", "")
            .with_field("use_watchlist", "False")
            .with_field("skip_frames", "two");

        assert_eq!(form.parse_or("threshold", 0.6f32).unwrap(), 0.7);
        assert_eq!(form.parse_or("fps", 3.0f64).unwrap(), 3.0);
        assert!(!form.flag("use_watchlist", true));
        assert!(form.flag("missing", true));
        assert_eq!(form.parse_or("skip_frames", 1u64).unwrap_err().status, 400);
        assert_eq!(form.parse_opt::<u64>("timeout_ms").unwrap(), None);
    }
}
