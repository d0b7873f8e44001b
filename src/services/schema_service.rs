use async_trait::async_trait;

use crate::models::stream::Stream;

/// Write-time content validator for schema-flagged streams.
///
/// The schema engine itself is an external collaborator; the record engine
/// only knows this seam and invokes it before committing an append when
/// `stream.has_schema` is set.
#[async_trait]
pub trait SchemaValidator: Send + Sync {
    async fn validate(
        &self,
        stream: &Stream,
        content: &[u8],
        content_type: &str,
    ) -> Result<(), String>;
}

/// Default validator: accepts everything.
pub struct NoopSchemaValidator;

#[async_trait]
impl SchemaValidator for NoopSchemaValidator {
    async fn validate(
        &self,
        _stream: &Stream,
        _content: &[u8],
        _content_type: &str,
    ) -> Result<(), String> {
        Ok(())
    }
}
