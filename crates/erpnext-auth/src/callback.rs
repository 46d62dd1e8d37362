//! Single-shot loopback listener for the authorization redirect
//!
//! Binds `127.0.0.1:<port>`, serves `GET /callback` exactly once, and
//! resolves to the authorization code or a typed error. The listener owns
//! the socket for the lifetime of one login attempt: `wait` shuts it down on
//! every exit path (code, denial, state mismatch, timeout, cancellation) and
//! `Drop` aborts the server task if the listener is abandoned early.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::CALLBACK_PATH;
use crate::error::{Error, Result};

/// Time allowed for the confirmation page to flush before the server task
/// is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type OutcomeSender = oneshot::Sender<Result<String>>;

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<String>,
    outcome_tx: Arc<Mutex<Option<OutcomeSender>>>,
}

impl CallbackState {
    /// The first `/callback` request takes the sender; later ones find `None`.
    fn take_sender(&self) -> Option<OutcomeSender> {
        match self.outcome_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

pub struct CallbackListener {
    port: u16,
    outcome_rx: Option<oneshot::Receiver<Result<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind the listener and start serving in the background.
    ///
    /// Port 0 picks an ephemeral port; `port()` reports the bound one.
    /// An occupied port fails with `Error::PortInUse` so the caller can pick
    /// another.
    pub async fn bind(port: u16, expected_state: impl Into<String>) -> Result<Self> {
        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(Error::PortInUse { port });
            }
            Err(e) => {
                return Err(Error::Io(format!(
                    "binding callback listener on port {port}: {e}"
                )));
            }
        };
        let port = listener
            .local_addr()
            .map_err(|e| Error::Io(format!("reading callback listener address: {e}")))?
            .port();

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let state = CallbackState {
            expected_state: Arc::new(expected_state.into()),
            outcome_tx: Arc::new(Mutex::new(Some(outcome_tx))),
        };
        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "callback listener stopped with error");
            }
        });

        info!(port, "callback listener bound");
        Ok(Self {
            port,
            outcome_rx: Some(outcome_rx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `http://localhost:<port>/callback`
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{CALLBACK_PATH}", self.port)
    }

    /// Wait for the redirect, bounded by `timeout` and `cancel`.
    ///
    /// The socket is released before this returns, whatever the outcome.
    pub async fn wait<C>(mut self, timeout: Duration, cancel: C) -> Result<String>
    where
        C: Future<Output = ()>,
    {
        let outcome = match self.outcome_rx.take() {
            Some(outcome_rx) => tokio::select! {
                received = outcome_rx => received.unwrap_or_else(|_| {
                    Err(Error::Io("callback listener stopped before a request arrived".into()))
                }),
                () = tokio::time::sleep(timeout) => Err(Error::CallbackTimeout {
                    timeout_secs: timeout.as_secs(),
                }),
                () = cancel => Err(Error::LoginCancelled),
            },
            None => Err(Error::Io("callback listener already consumed".into())),
        };
        self.shutdown().await;
        outcome
    }

    /// Stop accepting, let the in-flight response flush, then join the task.
    async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }
        debug!(port = self.port, "callback listener released");
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    let Some(outcome_tx) = state.take_sender() else {
        warn!("ignoring extra request to callback listener");
        return (
            StatusCode::CONFLICT,
            Html(page(
                "Authentication Failed",
                "This login attempt has already completed.",
            )),
        );
    };

    let outcome = classify(&params, &state.expected_state);
    let response = match &outcome {
        Ok(_) => (
            StatusCode::OK,
            Html(page(
                "Authentication Successful",
                "You can close this window and return to the terminal.",
            )),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Html(page("Authentication Failed", &format!("Error: {e}"))),
        ),
    };
    let _ = outcome_tx.send(outcome);
    response
}

/// Map the redirect's query parameters to a code or an error.
///
/// An `error` parameter wins over everything else; otherwise `state` must
/// match before the code is accepted.
fn classify(params: &HashMap<String, String>, expected_state: &str) -> Result<String> {
    if let Some(error) = params.get("error") {
        return Err(Error::AuthorizationDenied {
            error: error.clone(),
            description: params.get("error_description").cloned(),
        });
    }
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(Error::StateMismatch);
    }
    match params.get("code") {
        Some(code) if !code.is_empty() => Ok(code.clone()),
        _ => Err(Error::AuthorizationDenied {
            error: "invalid_request".into(),
            description: Some("callback carried no authorization code".into()),
        }),
    }
}

fn page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body><h1>{title}</h1><p>{}</p></body>\n</html>\n",
        escape_html(message)
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    async fn assert_port_free(port: u16) {
        TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap_or_else(|e| panic!("port {port} still bound: {e}"));
    }

    /// Issue the browser redirect from a background task.
    fn redirect(port: u16, query: &'static str) -> JoinHandle<reqwest::Response> {
        tokio::spawn(async move {
            reqwest::get(format!("http://127.0.0.1:{port}/callback?{query}"))
                .await
                .unwrap()
        })
    }

    #[tokio::test]
    async fn returns_code_when_state_matches() {
        let listener = CallbackListener::bind(0, "s1").await.unwrap();
        let port = listener.port();
        let browser = redirect(port, "code=abc123&state=s1");

        let code = listener.wait(WAIT, std::future::pending()).await.unwrap();
        assert_eq!(code, "abc123");

        let response = browser.await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().contains("Authentication Successful"));
        assert_port_free(port).await;
    }

    #[tokio::test]
    async fn mismatched_state_is_rejected() {
        let listener = CallbackListener::bind(0, "expected").await.unwrap();
        let port = listener.port();
        let browser = redirect(port, "code=abc123&state=forged");

        let result = listener.wait(WAIT, std::future::pending()).await;
        assert!(matches!(result, Err(Error::StateMismatch)), "{result:?}");

        let response = browser.await.unwrap();
        assert_eq!(response.status(), 400);
        assert!(response.text().await.unwrap().contains("Authentication Failed"));
        assert_port_free(port).await;
    }

    #[tokio::test]
    async fn missing_state_is_a_mismatch() {
        let listener = CallbackListener::bind(0, "expected").await.unwrap();
        let port = listener.port();
        let _browser = redirect(port, "code=abc123");

        let result = listener.wait(WAIT, std::future::pending()).await;
        assert!(matches!(result, Err(Error::StateMismatch)), "{result:?}");
        assert_port_free(port).await;
    }

    #[tokio::test]
    async fn access_denied_surfaces_server_error() {
        let listener = CallbackListener::bind(0, "s1").await.unwrap();
        let port = listener.port();
        let browser = redirect(
            port,
            "error=access_denied&error_description=User%20said%20%3Cno%3E",
        );

        let result = listener.wait(WAIT, std::future::pending()).await;
        match result {
            Err(Error::AuthorizationDenied { error, description }) => {
                assert_eq!(error, "access_denied");
                assert_eq!(description.as_deref(), Some("User said <no>"));
            }
            other => panic!("expected AuthorizationDenied, got {other:?}"),
        }

        let body = browser.await.unwrap().text().await.unwrap();
        assert!(body.contains("User said &lt;no&gt;"), "{body}");
        assert_port_free(port).await;
    }

    #[tokio::test]
    async fn times_out_and_releases_port() {
        let listener = CallbackListener::bind(0, "s1").await.unwrap();
        let port = listener.port();

        let result = listener
            .wait(Duration::from_millis(200), std::future::pending())
            .await;
        assert!(matches!(result, Err(Error::CallbackTimeout { .. })), "{result:?}");
        assert_port_free(port).await;
    }

    #[tokio::test]
    async fn cancellation_releases_port() {
        let listener = CallbackListener::bind(0, "s1").await.unwrap();
        let port = listener.port();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = cancel_tx.send(());
        });
        let result = listener
            .wait(WAIT, async {
                let _ = cancel_rx.await;
            })
            .await;

        assert!(matches!(result, Err(Error::LoginCancelled)), "{result:?}");
        assert_port_free(port).await;
    }

    #[tokio::test]
    async fn occupied_port_is_reported() {
        let occupant = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = occupant.local_addr().unwrap().port();

        let result = CallbackListener::bind(port, "s1").await;
        assert!(matches!(result, Err(Error::PortInUse { port: p }) if p == port));
    }

    #[tokio::test]
    async fn other_paths_do_not_consume_the_listener() {
        let listener = CallbackListener::bind(0, "s1").await.unwrap();
        let port = listener.port();

        let stray = reqwest::get(format!("http://127.0.0.1:{port}/favicon.ico"))
            .await
            .unwrap();
        assert_eq!(stray.status(), 404);

        let _browser = redirect(port, "code=c&state=s1");
        assert_eq!(listener.wait(WAIT, std::future::pending()).await.unwrap(), "c");
    }

    #[test]
    fn redirect_uri_uses_localhost_and_callback_path() {
        let listener = CallbackListener {
            port: 8585,
            outcome_rx: None,
            shutdown_tx: None,
            handle: None,
        };
        assert_eq!(listener.redirect_uri(), "http://localhost:8585/callback");
    }

    #[test]
    fn error_parameter_takes_precedence_over_state() {
        let params: HashMap<String, String> = [
            ("error".to_string(), "access_denied".to_string()),
            ("state".to_string(), "wrong".to_string()),
        ]
        .into();
        assert!(matches!(
            classify(&params, "s1"),
            Err(Error::AuthorizationDenied { .. })
        ));
    }

    #[test]
    fn empty_code_is_rejected() {
        let params: HashMap<String, String> = [
            ("code".to_string(), String::new()),
            ("state".to_string(), "s1".to_string()),
        ]
        .into();
        assert!(classify(&params, "s1").is_err());
    }
}
