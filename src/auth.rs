//! Authentication flows.
//!
//! An [`Auth`] produces a *flow*: a short conversation of request/response
//! exchanges with the server. The flow yields the first request with
//! [`AuthFlow::start`]; for each response the client hands back,
//! [`AuthFlow::resume`] either yields a follow-up request or finishes,
//! letting the last response through to the caller.
//!
//! Static schemes like [`BasicAuth`] are one-shot: `start` decorates the
//! request and `resume` always finishes. Challenge-response schemes keep a
//! replayable copy of the request and answer challenges from `resume` —
//! declare [`requires_request_body`](Auth::requires_request_body) so the
//! client buffers the body before the flow begins.

use std::{fmt, sync::Arc};

use crate::{request::Request, response::Response, util};

/// An authentication scheme, shared by the client and cheap to clone.
pub trait Auth: Send + Sync + fmt::Debug {
    /// Whether the request body must be buffered (made replayable) before
    /// the flow starts. Required by schemes that resend the request in
    /// answer to a challenge.
    fn requires_request_body(&self) -> bool {
        false
    }

    /// Whether each response body must be fully read before it is handed
    /// to [`AuthFlow::resume`].
    fn requires_response_body(&self) -> bool {
        false
    }

    /// Begin a flow for one logical request.
    fn flow(&self) -> Box<dyn AuthFlow>;
}

/// One in-progress authentication conversation.
pub trait AuthFlow: Send {
    /// Produce the first request to send.
    fn start(&mut self, request: Request) -> crate::Result<Request>;

    /// Given the response to the previously yielded request, produce a
    /// follow-up request, or `None` to finish and surface that response.
    fn resume(&mut self, response: &Response) -> crate::Result<Option<Request>>;
}

/// No authentication: passes the request through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuth;

impl Auth for NoAuth {
    fn flow(&self) -> Box<dyn AuthFlow> {
        Box::new(NoAuthFlow)
    }
}

struct NoAuthFlow;

impl AuthFlow for NoAuthFlow {
    fn start(&mut self, request: Request) -> crate::Result<Request> {
        Ok(request)
    }

    fn resume(&mut self, _response: &Response) -> crate::Result<Option<Request>> {
        Ok(None)
    }
}

/// HTTP Basic authentication, injected up front on the first request.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: Option<String>,
}

impl BasicAuth {
    /// Create a Basic auth scheme from a username and optional password.
    pub fn new(username: impl Into<String>, password: Option<impl Into<String>>) -> BasicAuth {
        BasicAuth {
            username: username.into(),
            password: password.map(Into::into),
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .finish()
    }
}

impl Auth for BasicAuth {
    fn flow(&self) -> Box<dyn AuthFlow> {
        Box::new(BasicAuthFlow {
            auth: self.clone(),
        })
    }
}

struct BasicAuthFlow {
    auth: BasicAuth,
}

impl AuthFlow for BasicAuthFlow {
    fn start(&mut self, mut request: Request) -> crate::Result<Request> {
        let value = util::basic_auth(&self.auth.username, self.auth.password.as_ref());
        request
            .headers_mut()
            .insert(http::header::AUTHORIZATION, value);
        Ok(request)
    }

    fn resume(&mut self, _response: &Response) -> crate::Result<Option<Request>> {
        Ok(None)
    }
}

/// Custom authentication from a user function applied to the request.
#[derive(Clone)]
pub struct FunctionAuth {
    func: Arc<dyn Fn(Request) -> crate::Result<Request> + Send + Sync>,
}

impl FunctionAuth {
    /// Wrap a function that decorates each outgoing request.
    pub fn new<F>(func: F) -> FunctionAuth
    where
        F: Fn(Request) -> crate::Result<Request> + Send + Sync + 'static,
    {
        FunctionAuth {
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FunctionAuth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FunctionAuth").finish()
    }
}

impl Auth for FunctionAuth {
    fn flow(&self) -> Box<dyn AuthFlow> {
        Box::new(FunctionAuthFlow {
            func: self.func.clone(),
        })
    }
}

struct FunctionAuthFlow {
    func: Arc<dyn Fn(Request) -> crate::Result<Request> + Send + Sync>,
}

impl AuthFlow for FunctionAuthFlow {
    fn start(&mut self, request: Request) -> crate::Result<Request> {
        (self.func)(request)
    }

    fn resume(&mut self, _response: &Response) -> crate::Result<Option<Request>> {
        Ok(None)
    }
}

/// HTTP Basic authentication that waits for a `401` challenge before
/// sending credentials, instead of volunteering them up front.
///
/// The original request is kept for replay, so streaming bodies must be
/// buffered first ([`requires_request_body`](Auth::requires_request_body)
/// is true).
#[derive(Clone)]
pub struct BasicChallengeAuth {
    inner: BasicAuth,
}

impl BasicChallengeAuth {
    /// Create a challenge-response Basic auth scheme.
    pub fn new(
        username: impl Into<String>,
        password: Option<impl Into<String>>,
    ) -> BasicChallengeAuth {
        BasicChallengeAuth {
            inner: BasicAuth::new(username, password),
        }
    }
}

impl fmt::Debug for BasicChallengeAuth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BasicChallengeAuth")
            .field("username", &self.inner.username)
            .finish()
    }
}

impl Auth for BasicChallengeAuth {
    fn requires_request_body(&self) -> bool {
        true
    }

    fn flow(&self) -> Box<dyn AuthFlow> {
        Box::new(BasicChallengeFlow {
            auth: self.inner.clone(),
            original: None,
            answered: false,
        })
    }
}

struct BasicChallengeFlow {
    auth: BasicAuth,
    original: Option<Request>,
    answered: bool,
}

impl AuthFlow for BasicChallengeFlow {
    fn start(&mut self, request: Request) -> crate::Result<Request> {
        self.original = request.try_clone();
        Ok(request)
    }

    fn resume(&mut self, response: &Response) -> crate::Result<Option<Request>> {
        if self.answered || response.status() != http::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let challenged = response
            .headers()
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| {
                v.trim_start().to_ascii_lowercase().starts_with("basic")
            });
        if !challenged {
            return Ok(None);
        }

        let mut retry = match self.original.take() {
            Some(retry) => retry,
            None => return Ok(None),
        };
        let value = util::basic_auth(&self.auth.username, self.auth.password.as_ref());
        retry
            .headers_mut()
            .insert(http::header::AUTHORIZATION, value);
        self.answered = true;
        Ok(Some(retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_injects_up_front() {
        let auth = BasicAuth::new("user", Some("pass"));
        let mut flow = auth.flow();
        let request = Request::new(http::Method::GET, "http://example.com/".parse().unwrap());
        let request = flow.start(request).unwrap();
        let value = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(value, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn challenge_auth_holds_credentials_until_asked() {
        let auth = BasicChallengeAuth::new("user", Some("pass"));
        assert!(auth.requires_request_body());

        let mut flow = auth.flow();
        let request = Request::new(http::Method::GET, "http://example.com/".parse().unwrap());
        let first = flow.start(request).unwrap();
        assert!(!first.headers().contains_key(http::header::AUTHORIZATION));
    }

    #[test]
    fn function_auth_applies_closure() {
        let auth = FunctionAuth::new(|mut request: Request| {
            request
                .headers_mut()
                .insert("x-api-key", http::HeaderValue::from_static("token"));
            Ok(request)
        });
        let mut flow = auth.flow();
        let request = Request::new(http::Method::GET, "http://example.com/".parse().unwrap());
        let request = flow.start(request).unwrap();
        assert_eq!(request.headers().get("x-api-key").unwrap(), "token");
    }
}
