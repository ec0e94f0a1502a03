//! HTTP request/response types and the transport seam.
//!
//! The transport is a trait so the auth gateway can be exercised without a
//! network. `UreqTransport` is the real implementation.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Ordered header list with case-insensitive names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace any existing value for `name`
    pub fn set(&mut self, name: &str, value: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.0.push((name.to_string(), value.to_string()));
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.set(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Parse a `Name: value` line as given on the command line
    pub fn parse_line(line: &str) -> Result<(String, String)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid header '{}', expected 'Name: value'", line))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("Invalid header '{}', empty name", line));
        }
        Ok((name.to_string(), value.trim().to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(Method::Post, url)
    }

    /// Attach a raw body; the caller chooses the content type
    pub fn body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `value` as the JSON body
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = Some(serde_json::to_string(value)?);
        self.headers.set("Content-Type", "application/json");
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .with_context(|| format!("Invalid JSON in response (status {})", self.status))
    }
}

/// Sends requests. Every HTTP status is a successful send; only
/// transport-level failures are errors.
pub trait Transport {
    fn send(&self, request: &Request) -> Result<Response>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, request: &Request) -> Result<Response> {
        (**self).send(request)
    }
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Transport for UreqTransport {
    fn send(&self, request: &Request) -> Result<Response> {
        let mut req = self.agent.request(request.method.as_str(), &request.url);
        for (name, value) in request.headers.iter() {
            req = req.set(name, value);
        }

        let resp = match &request.body {
            Some(body) => req.send_string(body),
            None => req.call(),
        };

        match resp {
            Ok(r) => into_response(r),
            // Error statuses are still responses; the caller interprets them
            Err(ureq::Error::Status(_, r)) => into_response(r),
            Err(e) => Err(anyhow!(
                "Request {} {} failed: {}",
                request.method.as_str(),
                request.url,
                e
            )),
        }
    }
}

fn into_response(resp: ureq::Response) -> Result<Response> {
    let status = resp.status();
    let mut headers = Headers::new();
    for name in resp.headers_names() {
        if let Some(value) = resp.header(&name) {
            headers.set(&name, value);
        }
    }
    let body = resp
        .into_string()
        .context("Failed to read response body")?;
    Ok(Response {
        status,
        headers,
        body,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Transport that records requests and replays canned responses
    #[derive(Default)]
    pub struct MockTransport {
        pub sent: RefCell<Vec<Request>>,
        responses: RefCell<VecDeque<Result<Response>>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, status: u16, body: &str) {
            self.responses.borrow_mut().push_back(Ok(Response {
                status,
                headers: Headers::new().with("Content-Type", "application/json"),
                body: body.to_string(),
            }));
        }

        pub fn fail(&self, message: &str) {
            self.responses
                .borrow_mut()
                .push_back(Err(anyhow!(message.to_string())));
        }

        pub fn last(&self) -> Request {
            self.sent
                .borrow()
                .last()
                .cloned()
                .expect("no request was sent")
        }
    }

    impl Transport for MockTransport {
        fn send(&self, request: &Request) -> Result<Response> {
            self.sent.borrow_mut().push(request.clone());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(Response {
                        status: 200,
                        headers: Headers::new(),
                        body: "{}".to_string(),
                    })
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("accept", "text/plain");
        assert_eq!(headers.get("Accept"), Some("text/plain"));
        assert!(headers.contains("ACCEPT"));

        headers.set("Accept", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("accept"), Some("application/json"));
    }

    #[test]
    fn test_parse_header_line() {
        let (name, value) = Headers::parse_line("X-Institute-Id: 42").unwrap();
        assert_eq!(name, "X-Institute-Id");
        assert_eq!(value, "42");

        // Values may contain colons
        let (_, value) = Headers::parse_line("Referer: http://localhost:5173/").unwrap();
        assert_eq!(value, "http://localhost:5173/");

        assert!(Headers::parse_line("no-colon").is_err());
        assert!(Headers::parse_line(": value").is_err());
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::from_str("get"), Some(Method::Get));
        assert_eq!(Method::from_str("DELETE"), Some(Method::Delete));
        assert!(Method::from_str("TRACE").is_none());
        assert_eq!(Method::Patch.as_str(), "PATCH");
    }

    #[test]
    fn test_request_json_sets_content_type() {
        let req = Request::post("http://localhost:8080/api/auth/login")
            .json(&serde_json::json!({"username": "u1", "password": "p"}))
            .unwrap();
        assert_eq!(req.headers.get("content-type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_str(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["username"], "u1");
    }

    #[test]
    fn test_response_status_classes() {
        let ok = Response {
            status: 204,
            headers: Headers::new(),
            body: String::new(),
        };
        assert!(ok.is_success());

        let denied = Response {
            status: 401,
            headers: Headers::new(),
            body: r#"{"error":"invalid token"}"#.to_string(),
        };
        assert!(!denied.is_success());
        let body: serde_json::Value = denied.json().unwrap();
        assert_eq!(body["error"], "invalid token");
    }
}
