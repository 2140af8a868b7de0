//! `http_request`: issues an HTTP call and stores the response in variables.
//!
//! A non-2xx status is data, stored like any other response. Only failures to
//! build, send or read the request are errors, plus a JSON body that does not
//! decode when JSON was expected.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Client, Method, Proxy,
    header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue},
    redirect,
};
use runbook_types::{Step, StepOutcome};
use runbook_util::http::{cookie_header, form_encode, header_map_to_json, is_json_content_type, object_pairs, parse_response_json};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;
use url::Url;

use super::{lenient, parse_fields};
use crate::{
    config::secs_to_duration,
    error::{EngineError, EngineResult},
    registry::{ActionDescriptor, ActionHandler, ActionScope},
    resolve::display_value,
    variables::is_identifier,
};

const HTTP_REQUEST: &str = "http_request";
const DEFAULT_RETURN_VAR: &str = "response";
const RESERVED_VARIABLES: &[&str] = &["status", "response_headers"];
const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

#[derive(Debug, Deserialize, JsonSchema)]
struct HttpRequestFields {
    #[schemars(description = "Absolute request URL")]
    url: String,
    #[schemars(description = "GET, POST, PUT, DELETE, PATCH, HEAD or OPTIONS; defaults to GET")]
    method: Option<String>,
    #[schemars(description = "Request headers as an object")]
    headers: Option<Map<String, Value>>,
    #[schemars(description = "Query parameters as an object")]
    params: Option<Map<String, Value>>,
    #[schemars(description = "Cookies as an object")]
    cookies: Option<Map<String, Value>>,
    #[schemars(description = "Proxy URL used for every scheme")]
    proxy: Option<String>,
    #[schemars(description = "Content-Type header value")]
    content_type: Option<String>,
    #[schemars(description = "JSON request body")]
    json: Option<Value>,
    /// Object bodies are form encoded; anything else is sent as text.
    data: Option<Value>,
    #[serde(default, deserialize_with = "lenient::number")]
    #[schemars(description = "Total timeout in seconds")]
    timeout: Option<f64>,
    #[serde(default, deserialize_with = "lenient::flag")]
    #[schemars(description = "Follow redirects; defaults to true")]
    allow_redirects: Option<bool>,
    #[serde(default, deserialize_with = "lenient::flag")]
    #[schemars(description = "Verify TLS certificates; defaults to true")]
    verify_ssl: Option<bool>,
    #[serde(default, deserialize_with = "lenient::flag")]
    #[schemars(description = "Decode the body as JSON whatever the response content type")]
    return_json: Option<bool>,
    #[schemars(description = "Variable receiving the response body; defaults to response")]
    return_var: Option<String>,
}

/// Request settings checked and normalized from the step fields.
struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    body: Option<RequestBody>,
    proxy: Option<String>,
    timeout: Option<f64>,
    allow_redirects: bool,
    verify_ssl: bool,
    return_json: bool,
    return_var: String,
}

enum RequestBody {
    Json(Value),
    Form(String),
    Text(String),
}

fn invalid(field: &str, reason: impl Into<String>) -> EngineError {
    EngineError::invalid_field(HTTP_REQUEST, field, reason)
}

fn prepare(step: &Step) -> EngineResult<PreparedRequest> {
    let fields: HttpRequestFields = parse_fields(HTTP_REQUEST, step)?;

    let method_name = fields.method.as_deref().unwrap_or("GET").trim().to_ascii_uppercase();
    if !METHODS.contains(&method_name.as_str()) {
        return Err(invalid("method", format!("unsupported method '{method_name}'")));
    }
    let method = Method::from_bytes(method_name.as_bytes()).map_err(|error| invalid("method", error.to_string()))?;

    let url = Url::parse(fields.url.trim()).map_err(|error| invalid("url", error.to_string()))?;

    let mut headers = HeaderMap::new();
    for (name, value) in fields.headers.iter().flatten() {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|error| invalid("headers", error.to_string()))?;
        let value = HeaderValue::from_str(&display_value(value)).map_err(|error| invalid("headers", error.to_string()))?;
        headers.insert(name, value);
    }
    if let Some(content_type) = fields.content_type.as_deref() {
        let value = HeaderValue::from_str(content_type).map_err(|error| invalid("content_type", error.to_string()))?;
        headers.insert(CONTENT_TYPE, value);
    }
    if let Some(cookies) = fields.cookies.as_ref().filter(|cookies| !cookies.is_empty()) {
        let value =
            HeaderValue::from_str(&cookie_header(cookies)).map_err(|error| invalid("cookies", error.to_string()))?;
        headers.insert(COOKIE, value);
    }

    let params = fields
        .params
        .map(|params| object_pairs(&Value::Object(params)).unwrap_or_default())
        .unwrap_or_default();

    let body = match (fields.json, fields.data) {
        (Some(json), _) => Some(RequestBody::Json(json)),
        (None, Some(Value::Object(form))) => Some(RequestBody::Form(form_encode(&form))),
        (None, Some(Value::Null)) | (None, None) => None,
        (None, Some(other)) => Some(RequestBody::Text(display_value(&other))),
    };

    if let Some(timeout) = fields.timeout
        && !(timeout.is_finite() && timeout > 0.0)
    {
        return Err(invalid("timeout", "must be a positive number"));
    }

    let return_var = fields.return_var.unwrap_or_else(|| DEFAULT_RETURN_VAR.to_string());
    if !is_identifier(&return_var) {
        return Err(invalid("return_var", format!("'{return_var}' is not a valid variable name")));
    }
    if RESERVED_VARIABLES.contains(&return_var.as_str()) {
        return Err(invalid("return_var", format!("'{return_var}' is reserved")));
    }

    Ok(PreparedRequest {
        method,
        url,
        headers,
        params,
        body,
        proxy: fields.proxy.filter(|proxy| !proxy.trim().is_empty()),
        timeout: fields.timeout,
        allow_redirects: fields.allow_redirects.unwrap_or(true),
        verify_ssl: fields.verify_ssl.unwrap_or(true),
        return_json: fields.return_json.unwrap_or(false),
        return_var,
    })
}

fn build_client(request: &PreparedRequest, timeout: Duration) -> EngineResult<Client> {
    let redirects = if request.allow_redirects {
        redirect::Policy::default()
    } else {
        redirect::Policy::none()
    };
    let mut builder = Client::builder()
        .timeout(timeout)
        .redirect(redirects)
        .danger_accept_invalid_certs(!request.verify_ssl);
    if let Some(proxy) = request.proxy.as_deref() {
        builder = builder.proxy(Proxy::all(proxy).map_err(|error| invalid("proxy", error.to_string()))?);
    }
    builder.build().map_err(|error| EngineError::http_transport(error.to_string()))
}

/// Response parts stored into the run's variables.
struct ReceivedResponse {
    status: u16,
    headers: Value,
    body: Value,
}

async fn send(client: &Client, request: PreparedRequest) -> EngineResult<ReceivedResponse> {
    let mut builder = client.request(request.method, request.url).headers(request.headers);
    if !request.params.is_empty() {
        builder = builder.query(&request.params);
    }
    builder = match request.body {
        Some(RequestBody::Json(json)) => builder.json(&json),
        Some(RequestBody::Form(form)) => builder
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form),
        Some(RequestBody::Text(text)) => builder.body(text),
        None => builder,
    };

    let response = builder
        .send()
        .await
        .map_err(|error| EngineError::http_transport(error.to_string()))?;
    let status = response.status().as_u16();
    let headers = header_map_to_json(response.headers());
    let declares_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(is_json_content_type);
    let text = response
        .text()
        .await
        .map_err(|error| EngineError::http_transport(error.to_string()))?;

    let body = if request.return_json || declares_json {
        if text.trim().is_empty() {
            Value::Null
        } else {
            parse_response_json(&text)
                .ok_or_else(|| EngineError::json_decode(format!("response from status {status} is not valid JSON")))?
        }
    } else {
        Value::String(text)
    };
    Ok(ReceivedResponse { status, headers, body })
}

struct HttpRequestAction;

#[async_trait]
impl ActionHandler for HttpRequestAction {
    fn validate(&self, step: &Step) -> EngineResult<()> {
        prepare(step).map(|_| ())
    }

    async fn execute(&self, step: &Step, scope: &ActionScope<'_>) -> EngineResult<StepOutcome> {
        let request = prepare(step)?;
        let timeout = request
            .timeout
            .map(secs_to_duration)
            .unwrap_or_else(|| scope.dispatcher.config().http_timeout());
        let client = build_client(&request, timeout)?;
        let method = request.method.clone();
        let url = request.url.clone();
        let return_var = request.return_var.clone();

        debug!(run_id = scope.run.run_id(), %method, %url, "sending http request");
        let response = tokio::select! {
            _ = scope.run.cancellation_token().cancelled() => return Err(EngineError::Cancelled),
            response = send(&client, request) => response?,
        };

        scope.run.set_variable(return_var.as_str(), response.body.clone());
        if return_var != DEFAULT_RETURN_VAR {
            scope.run.set_variable(DEFAULT_RETURN_VAR, response.body);
        }
        scope.run.set_variable("status", json!(response.status));
        scope.run.set_variable("response_headers", response.headers);

        Ok(StepOutcome::success(
            HTTP_REQUEST,
            format!("HTTP request {method} {url} status: {}", response.status),
        ))
    }
}

pub(crate) fn descriptor() -> ActionDescriptor {
    ActionDescriptor::new(HTTP_REQUEST, "Send an HTTP request and store the response", HttpRequestAction)
        .required(&["url"])
        .optional(&[
            "method",
            "headers",
            "params",
            "cookies",
            "proxy",
            "content_type",
            "json",
            "data",
            "timeout",
            "allow_redirects",
            "verify_ssl",
            "return_json",
            "return_var",
        ])
        .schema_from::<HttpRequestFields>()
}

#[cfg(test)]
mod tests {
    use runbook_types::{ErrorKind, RunOptions};

    use super::*;
    use crate::{config::EngineConfig, dispatch::Dispatcher, run::RunContext};

    fn step(value: Value) -> Step {
        Step::from_value(&value).expect("step")
    }

    #[test]
    fn prepare_builds_headers_cookies_and_form_body() {
        let request = prepare(&step(json!({
            "action": HTTP_REQUEST,
            "url": "http://localhost:9/items",
            "method": "post",
            "headers": {"X-Trace": 7},
            "cookies": {"session": "abc"},
            "params": {"page": 2},
            "data": {"name": "a b"},
        })))
        .expect("prepared");
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers["x-trace"], "7");
        assert_eq!(request.headers[COOKIE], "session=abc");
        assert_eq!(request.params, vec![("page".to_string(), "2".to_string())]);
        assert!(matches!(request.body, Some(RequestBody::Form(ref form)) if form == "name=a+b"));
        assert_eq!(request.return_var, "response");
    }

    #[test]
    fn json_body_wins_over_data() {
        let request = prepare(&step(json!({
            "action": HTTP_REQUEST, "url": "http://localhost:9", "json": {"a": 1}, "data": "raw",
        })))
        .expect("prepared");
        assert!(matches!(request.body, Some(RequestBody::Json(_))));
    }

    #[test]
    fn prepare_rejects_bad_options() {
        for (fields, field) in [
            (json!({"url": "http://localhost:9", "method": "TRACE"}), "method"),
            (json!({"url": "not a url"}), "url"),
            (json!({"url": "http://localhost:9", "return_var": "status"}), "return_var"),
            (json!({"url": "http://localhost:9", "return_var": "my-var"}), "return_var"),
            (json!({"url": "http://localhost:9", "timeout": -2}), "timeout"),
        ] {
            let mut fields = fields.as_object().cloned().expect("object");
            fields.insert("action".into(), json!(HTTP_REQUEST));
            match prepare(&Step::new(fields)) {
                Err(EngineError::InvalidField { field: reported, .. }) => assert_eq!(reported, field),
                other => panic!("expected invalid {field}, got {:?}", other.map(|_| ())),
            }
        }
    }

    /// Serves one canned HTTP/1.1 response on a local port and returns the base URL.
    async fn serve_once(status_line: &str, content_type: &str, body: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buffer = [0u8; 4096];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buffer).await.expect("read");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            socket.write_all(response.as_bytes()).await.expect("write");
            let _ = socket.shutdown().await;
        });
        format!("http://{address}/")
    }

    async fn dispatch_http(fields: Value) -> (RunContext, StepOutcome) {
        let config = EngineConfig::default();
        let run = RunContext::new("http", RunOptions::default(), &config);
        let dispatcher = Dispatcher::with_builtins(config).expect("dispatcher");
        let outcome = dispatcher.dispatch(&step(fields), &run).await;
        (run, outcome)
    }

    #[tokio::test]
    async fn error_statuses_are_stored_as_data() {
        let url = serve_once("404 Not Found", "application/json", r#"{"err":"nope"}"#).await;
        let (run, outcome) = dispatch_http(json!({"action": HTTP_REQUEST, "url": url, "timeout": 5})).await;

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.message, format!("HTTP request GET {url} status: 404"));
        assert_eq!(run.variable("status"), Some(json!(404)));
        assert_eq!(run.variable("response"), Some(json!({"err": "nope"})));
        let headers = run.variable("response_headers").expect("headers");
        assert_eq!(headers["content-type"], json!("application/json"));
    }

    #[tokio::test]
    async fn json_bodies_land_in_return_var_and_response() {
        let url = serve_once("200 OK", "application/json; charset=utf-8", r#"{"items":[1,2]}"#).await;
        let (run, outcome) = dispatch_http(json!({
            "action": HTTP_REQUEST, "url": url, "return_var": "payload", "timeout": 5,
        }))
        .await;

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(run.variable("payload"), Some(json!({"items": [1, 2]})));
        assert_eq!(run.variable("response"), Some(json!({"items": [1, 2]})));
        assert_eq!(run.variable("status"), Some(json!(200)));
    }

    #[tokio::test]
    async fn text_bodies_stay_text_unless_json_is_forced() {
        let url = serve_once("200 OK", "text/plain", "[1, 2]").await;
        let (run, _) = dispatch_http(json!({"action": HTTP_REQUEST, "url": url, "timeout": 5})).await;
        assert_eq!(run.variable("response"), Some(json!("[1, 2]")));

        let url = serve_once("200 OK", "text/plain", "[1, 2]").await;
        let (run, _) = dispatch_http(json!({"action": HTTP_REQUEST, "url": url, "return_json": true, "timeout": 5})).await;
        assert_eq!(run.variable("response"), Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn undecodable_json_bodies_fail_the_step() {
        let url = serve_once("200 OK", "application/json", "<html>oops</html>").await;
        let (run, outcome) = dispatch_http(json!({"action": HTTP_REQUEST, "url": url, "timeout": 5})).await;

        assert_eq!(outcome.error_kind, Some(ErrorKind::JsonDecode));
        assert_eq!(run.variable("status"), None);
    }

    #[tokio::test]
    async fn transport_failures_are_step_errors() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let config = EngineConfig::default();
        let run = RunContext::new("http", RunOptions::default(), &config);
        let dispatcher = Dispatcher::with_builtins(config).expect("dispatcher");
        let outcome = dispatcher
            .dispatch(
                &step(json!({"action": HTTP_REQUEST, "url": format!("http://127.0.0.1:{port}/"), "timeout": 2})),
                &run,
            )
            .await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::HttpTransport));
        assert_eq!(run.variable("status"), None);
    }
}
