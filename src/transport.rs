//! License transports.
//!
//! The controller never performs I/O itself. It hands each [`LicenseRequest`]
//! to a [`LicenseTransport`] and expects the outcome back through
//! `ProtectionController::handle_license_response`.
use crate::error::Result;
use crate::exchange::ExchangeId;
use crate::license::LicenseRequest;

pub trait LicenseTransport {
    /// Start one exchange. An `Err` means nothing was sent.
    fn send(&mut self, id: ExchangeId, request: &LicenseRequest) -> Result<()>;

    /// Abandon an exchange. Its completion, if any, is no longer expected.
    fn abort(&mut self, id: ExchangeId);
}

#[cfg(feature = "http")]
pub use self::http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::collections::HashMap;

    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
    use reqwest::Client;
    use tokio::runtime::Handle;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::task::JoinHandle;

    use super::LicenseTransport;
    use crate::error::{Error, Result};
    use crate::exchange::ExchangeId;
    use crate::license::{
        ExchangeResult, HttpMethod, LicenseRequest, LicenseResponse, ResponseType, TransportError,
    };

    /// reqwest-backed transport running exchanges on a tokio runtime.
    ///
    /// Completions arrive on the receiver returned by [`HttpTransport::channel`]
    /// and must be passed to the controller by the host.
    #[derive(Debug)]
    pub struct HttpTransport {
        client: Client,
        credentialed: Client,
        runtime: Handle,
        completions: UnboundedSender<(ExchangeId, ExchangeResult)>,
        tasks: HashMap<ExchangeId, JoinHandle<()>>,
    }

    impl HttpTransport {
        pub fn new(
            runtime: Handle,
            completions: UnboundedSender<(ExchangeId, ExchangeResult)>,
        ) -> Result<Self> {
            let client = Client::builder()
                .user_agent("rseme")
                .build()
                .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {}", e)))?;
            let credentialed = Client::builder()
                .user_agent("rseme")
                .cookie_store(true)
                .build()
                .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {}", e)))?;

            Ok(Self {
                client,
                credentialed,
                runtime,
                completions,
                tasks: HashMap::new(),
            })
        }

        /// Transport on the current runtime plus the receiving end of its
        /// completion channel.
        pub fn channel() -> Result<(Self, UnboundedReceiver<(ExchangeId, ExchangeResult)>)> {
            let runtime = Handle::try_current()
                .map_err(|e| Error::Transport(format!("No tokio runtime: {}", e)))?;
            let (tx, rx) = unbounded_channel();
            Ok((Self::new(runtime, tx)?, rx))
        }

        fn headers(request: &LicenseRequest) -> Result<HeaderMap> {
            let mut headers = HeaderMap::new();
            for (name, value) in &request.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::Transport(format!("Invalid header name {}: {}", name, e)))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| Error::Transport(format!("Invalid header value: {}", e)))?;
                headers.insert(name, value);
            }
            if request.response_type == ResponseType::Json && !headers.contains_key(ACCEPT) {
                headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
            }
            Ok(headers)
        }
    }

    impl LicenseTransport for HttpTransport {
        fn send(&mut self, id: ExchangeId, request: &LicenseRequest) -> Result<()> {
            self.tasks.retain(|_, task| !task.is_finished());

            let client = if request.with_credentials {
                &self.credentialed
            } else {
                &self.client
            };
            let builder = match request.method {
                HttpMethod::Get => client.get(&request.url),
                HttpMethod::Post => client.post(&request.url).body(request.body.clone()),
            }
            .headers(Self::headers(request)?);

            let completions = self.completions.clone();
            let url = request.url.clone();
            let task = self.runtime.spawn(async move {
                let result = match builder.send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        match response.bytes().await {
                            Ok(body) => Ok(LicenseResponse::new(status, body.to_vec())),
                            Err(e) => Err(TransportError::Network(e.to_string())),
                        }
                    }
                    Err(e) if e.is_timeout() => Err(TransportError::TimedOut),
                    Err(e) => Err(TransportError::Network(e.to_string())),
                };
                if completions.send((id, result)).is_err() {
                    debug!("{} to {} finished after the receiver closed", id, url);
                }
            });
            self.tasks.insert(id, task);
            Ok(())
        }

        fn abort(&mut self, id: ExchangeId) {
            if let Some(task) = self.tasks.remove(&id) {
                task.abort();
            }
        }
    }

}
