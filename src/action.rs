//! Per-host actions and the stateless redirect handler

use crate::error::{empty, json_error_response, text_response, ProxyBody, ProxyErrorCode};
use crate::sites::one_or_many;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

/// Behaviour attached to a virtual host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Redirect {
        to: String,
        #[serde(default = "default_redirect_code")]
        code: u16,
    },
    Proxy {
        to: String,
        #[serde(default, rename = "websocket", alias = "websocketTo")]
        websocket_to: Option<String>,
    },
    Serve {
        #[serde(rename = "path", alias = "rootPath")]
        root_path: PathBuf,
        #[serde(
            default = "default_index_names",
            rename = "index",
            alias = "indexNames",
            deserialize_with = "one_or_many"
        )]
        index_names: Vec<String>,
    },
    None,
}

fn default_redirect_code() -> u16 {
    302
}

pub fn default_index_names() -> Vec<String> {
    vec!["index.html".to_string(), "index.htm".to_string()]
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Redirect { .. } => "redirect",
            Action::Proxy { .. } => "proxy",
            Action::Serve { .. } => "serve",
            Action::None => "none",
        }
    }
}

/// Substitute `$host` and `$path` in a target template.
///
/// `host` is the request's Host header verbatim and `path` is the request
/// path and query without the leading slash.
pub fn substitute(template: &str, host: &str, path: &str) -> String {
    template.replace("$host", host).replace("$path", path)
}

/// Request path and query with the leading slash removed
pub fn path_token(uri: &hyper::Uri) -> &str {
    let pq = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    pq.strip_prefix('/').unwrap_or(pq)
}

pub fn redirect(to: &str, code: u16, host: &str, path: &str) -> Response<ProxyBody> {
    let target = substitute(to, host, path);

    let status = match StatusCode::from_u16(code) {
        Ok(status) if status.is_redirection() => status,
        _ => StatusCode::FOUND,
    };

    let location = match HeaderValue::from_str(&target) {
        Ok(value) => value,
        Err(_) => {
            warn!(location = %target, "Redirect target is not a valid header value");
            return json_error_response(ProxyErrorCode::InternalError, "Invalid redirect target");
        }
    };

    let mut response = text_response(status, format!("Redirecting to {}", target));
    response.headers_mut().insert(hyper::header::LOCATION, location);
    response
}

/// Reply for hosts configured with no action
pub fn no_content() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty())
        .expect("valid response builder")
}
