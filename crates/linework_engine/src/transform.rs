use serde_json::Value;

use crate::types::TransformError;

/// Derives the output of one record from its raw bytes.
///
/// Implementations hold no per-record state; one value is shared by every
/// worker of the pool.
#[async_trait::async_trait]
pub trait Transform: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn process(&self, raw: &[u8]) -> Result<Self::Output, TransformError>;
}

/// Passes each record through unchanged as UTF-8 text.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

#[async_trait::async_trait]
impl Transform for IdentityTransform {
    type Output = String;

    async fn process(&self, raw: &[u8]) -> Result<String, TransformError> {
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|err| TransformError::Malformed(err.to_string()))
    }
}

/// Picks one delimited field of a line and parses it as JSON.
#[derive(Debug, Clone)]
pub struct JsonFieldTransform {
    pub delimiter: String,
    /// 1-based field position.
    pub field: usize,
}

impl Default for JsonFieldTransform {
    fn default() -> Self {
        Self {
            delimiter: "\t".to_string(),
            field: 2,
        }
    }
}

impl JsonFieldTransform {
    pub fn new(delimiter: impl Into<String>, field: usize) -> Self {
        Self {
            delimiter: delimiter.into(),
            field,
        }
    }

    fn select<'a>(&self, line: &'a str) -> Result<&'a str, TransformError> {
        if self.field == 0 {
            return Err(TransformError::Malformed("field positions start at 1".into()));
        }
        line.split(self.delimiter.as_str())
            .nth(self.field - 1)
            .ok_or_else(|| {
                TransformError::Malformed(format!("expected at least {} fields", self.field))
            })
    }
}

#[async_trait::async_trait]
impl Transform for JsonFieldTransform {
    type Output = Value;

    async fn process(&self, raw: &[u8]) -> Result<Value, TransformError> {
        let line =
            std::str::from_utf8(raw).map_err(|err| TransformError::Malformed(err.to_string()))?;
        let field = self.select(line)?;
        Ok(serde_json::from_str(field)?)
    }
}
