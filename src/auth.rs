//! gRPC interceptor that injects store credentials into outgoing requests.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::config::Credentials;

/// gRPC interceptor that attaches an HTTP basic `authorization` header
/// built from the store [`Credentials`].
///
/// The header value is precomputed at construction because credentials
/// are immutable for the process lifetime. Tonic interceptors run
/// synchronously on every outgoing RPC.
#[derive(Debug, Clone)]
pub(crate) struct BasicAuthInterceptor {
    /// Precomputed `Basic <base64(user:pass)>` header value.
    header: String,
}

impl BasicAuthInterceptor {
    /// Build an interceptor for the given credentials.
    pub(crate) fn new(credentials: &Credentials) -> Self {
        let raw = format!("{}:{}", credentials.username, credentials.password);
        Self {
            header: format!("Basic {}", STANDARD.encode(raw)),
        }
    }
}

impl tonic::service::Interceptor for BasicAuthInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        let value = self
            .header
            .parse::<tonic::metadata::MetadataValue<_>>()
            .map_err(|_| tonic::Status::internal("invalid credential characters"))?;
        req.metadata_mut().insert("authorization", value);
        Ok(req)
    }
}
