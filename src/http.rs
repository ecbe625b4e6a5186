use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use headers::{Authorization, HeaderMapExt};
use http::header::{ACCEPT_ENCODING, AUTHORIZATION, USER_AGENT};
use http::{HeaderMap, Request, Response, header::HeaderValue};
use http_body_util::Full;
use hyper::body::{Body, Incoming};
use hyper_rustls::{ConfigBuilderExt, HttpsConnector};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{self, Attributes, exponential_buckets};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("load native root certificates failed: {0}")]
    NativeCerts(std::io::Error),
    #[error("failed to make HTTP(S) request: {0}")]
    CallRequest(#[from] hyper_util::client::legacy::Error),
    #[error("failed to read response body: {0}")]
    ReadIncoming(#[from] hyper::Error),
    #[error("failed to build HTTP request: {0}")]
    BuildRequest(#[from] http::Error),
}

#[derive(Clone)]
pub struct HttpClient<B = Full<Bytes>> {
    client: Client<HttpsConnector<HttpConnector>, B>,
    user_agent: HeaderValue,
}

impl<B> HttpClient<B>
where
    B: fmt::Debug + Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<crate::Error>,
{
    pub fn new() -> Result<HttpClient<B>, HttpError> {
        let config = ClientConfig::builder()
            .with_native_roots()
            .map_err(HttpError::NativeCerts)?
            .with_no_client_auth();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let https = HttpsConnector::from((http, config));

        let client = Client::builder(TokioExecutor::new()).build(https);
        let user_agent = HeaderValue::from_str(&format!("hetzner-sd/{}", crate::get_version()))
            .map_err(|err| HttpError::BuildRequest(err.into()))?;

        Ok(HttpClient { client, user_agent })
    }

    pub async fn send(&self, mut req: Request<B>) -> Result<Response<Incoming>, HttpError> {
        default_request_headers(&mut req, &self.user_agent);

        // Capture the time right before we issue the request. Request doesn't
        // start the processing until we start polling it.
        let before = Instant::now();
        let result = self.client.request(req).await;
        let roundtrip = before.elapsed();

        let resp = result.inspect_err(|err| {
            metrics::register_counter(
                "http_client_request_errors_total",
                "The total number of HTTP client request errors.",
            )
            .recorder([("error", err.to_string().into())])
            .inc(1);
        })?;

        debug!(
            message = "HTTP response received",
            status = %resp.status(),
            version = ?resp.version(),
        );

        let attrs = Attributes::from([("status", resp.status().as_u16().to_string().into())]);
        metrics::register_counter(
            "http_client_requests_total",
            "The total number of HTTP client requests.",
        )
        .recorder(attrs.clone())
        .inc(1);
        metrics::register_histogram(
            "http_client_request_duration_seconds",
            "The round-trip time of HTTP client requests.",
            exponential_buckets(0.01, 2.0, 10),
        )
        .recorder(attrs)
        .record(roundtrip.as_secs_f64());

        Ok(resp)
    }
}

fn default_request_headers<B>(request: &mut Request<B>, user_agent: &HeaderValue) {
    if !request.headers().contains_key(USER_AGENT) {
        request.headers_mut().insert(USER_AGENT, user_agent.clone());
    }

    if !request.headers().contains_key(ACCEPT_ENCODING) {
        // compressed responses are not supported
        request
            .headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    }
}

impl<B> fmt::Debug for HttpClient<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// The authentication strategy for http request/response
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "strategy")]
pub enum Auth {
    /// Basic authentication.
    ///
    /// The username and password are concatenated and encoded via [base64][base64].
    ///
    /// [base64]: https://en.wikipedia.org/wiki/Base64
    Basic {
        /// The basic authentication username.
        user: String,

        /// The basic authentication password.
        password: String,
    },

    /// Bearer authentication.
    ///
    /// The bearer token value (OAuth2, JWT, etc) is passed as-is.
    Bearer {
        /// The bearer authentication token.
        token: String,
    },
}

impl Auth {
    pub fn basic(user: String, password: String) -> Self {
        Self::Basic { user, password }
    }

    pub fn bearer(token: String) -> Self {
        Self::Bearer { token }
    }

    pub fn apply<B>(&self, req: &mut Request<B>) {
        self.apply_headers_map(req.headers_mut())
    }

    pub fn apply_headers_map(&self, map: &mut HeaderMap) {
        match &self {
            Auth::Basic { user, password } => {
                let auth = Authorization::basic(user, password);
                map.typed_insert(auth);
            }
            Auth::Bearer { token } => match Authorization::bearer(token) {
                Ok(auth) => map.typed_insert(auth),
                Err(err) => error!(message = "Invalid bearer token", %err),
            },
        }
    }

    pub fn authorizer(&self) -> Authorizer {
        match self {
            Auth::Basic { user, password } => {
                use base64::prelude::{BASE64_STANDARD, Engine as _};

                let token = BASE64_STANDARD.encode(format!("{user}:{password}"));

                Authorizer::Basic(format!("Basic {token}"))
            }
            Auth::Bearer { token } => Authorizer::Bearer(format!("Bearer {token}")),
        }
    }
}

pub trait MaybeAuth: Sized {
    fn choose_one(&self, other: &Self) -> crate::Result<Self>;
}

impl MaybeAuth for Option<Auth> {
    fn choose_one(&self, other: &Self) -> crate::Result<Self> {
        if self.is_some() && other.is_some() {
            Err("Two authorization credentials was provided.".into())
        } else {
            Ok(self.clone().or_else(|| other.clone()))
        }
    }
}

/// Precomputed header value for incoming request authorization. Requests are
/// accepted when the `Authorization` header equals this value exactly.
#[derive(Clone, Debug)]
pub enum Authorizer {
    Basic(String),
    Bearer(String),
}

impl Authorizer {
    pub fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return false;
        };

        match self {
            Authorizer::Basic(token) => token == value,
            Authorizer::Bearer(token) => token == value,
        }
    }

    /// WWW-Authenticate value sent alongside a 401.
    pub fn challenge(&self) -> HeaderValue {
        match self {
            Authorizer::Basic(_) => HeaderValue::from_static("Basic realm=\"hetzner-sd\""),
            Authorizer::Bearer(_) => HeaderValue::from_static("Bearer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use http_body_util::Full;

    #[test]
    fn default_request_headers_defaults() {
        let user_agent = HeaderValue::from_static("hetzner-sd");
        let mut request = Request::post("http://example.com").body(()).unwrap();
        default_request_headers(&mut request, &user_agent);
        assert_eq!(
            request.headers().get(ACCEPT_ENCODING),
            Some(&HeaderValue::from_static("identity")),
        );
        assert_eq!(request.headers().get(USER_AGENT), Some(&user_agent));
    }

    #[test]
    fn default_request_headers_does_not_overwrite() {
        let mut request = Request::post("http://example.com")
            .header(ACCEPT_ENCODING, "gzip")
            .header(USER_AGENT, "foo")
            .body(())
            .unwrap();
        default_request_headers(&mut request, &HeaderValue::from_static("hetzner-sd"));
        assert_eq!(
            request.headers().get(ACCEPT_ENCODING),
            Some(&HeaderValue::from_static("gzip")),
        );
        assert_eq!(
            request.headers().get(USER_AGENT),
            Some(&HeaderValue::from_static("foo"))
        );
    }

    #[test]
    fn set_and_verify() {
        let auth = Auth::Basic {
            user: "admin".into(),
            password: "password".into(),
        };
        let authorizer = auth.authorizer();

        let mut req = Request::builder()
            .uri("https://example.com")
            .body(Full::<Bytes>::default())
            .unwrap();

        assert!(!authorizer.authorized(req.headers()));

        auth.apply(&mut req);
        assert!(authorizer.authorized(req.headers()));

        let auth = Auth::Bearer {
            token: "token".into(),
        };
        auth.apply(&mut req);
        assert!(!authorizer.authorized(req.headers()));
        assert!(auth.authorizer().authorized(req.headers()));
    }

    #[test]
    fn choose_one() {
        let basic = Some(Auth::basic("admin".into(), "password".into()));
        let bearer = Some(Auth::bearer("token".into()));

        assert_eq!(basic.choose_one(&None).unwrap(), basic);
        assert_eq!(None.choose_one(&bearer).unwrap(), bearer);
        assert!(basic.choose_one(&bearer).is_err());
    }
}
