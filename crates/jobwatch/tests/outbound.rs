use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::post;
use axum::{Json, Router};
use jobwatch::formatter::{ContentRenderer as _, Formatter, LlmRenderer, basic_html};
use jobwatch::notifier::{Notifier as _, NotifyError, ResendNotifier};
use jobwatch::posting::Posting;
use serde_json::{Value, json};
use url::Url;

/// Authorization header and JSON body of every captured request.
type Captured = Arc<Mutex<Vec<(String, Value)>>>;

fn record(captured: &Captured, headers: &HeaderMap, body: Value) {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    captured.lock().unwrap().push((auth, body));
}

async fn completion(
    State(captured): State<Captured>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record(&captured, &headers, body);
    Json(json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": "```html\n<html><body><p>Rendered</p></body></html>\n```"
            }
        }]
    }))
}

async fn emails(
    State(captured): State<Captured>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record(&captured, &headers, body);
    Json(json!({ "id": "4ef9a417-02e9-4d39-ad75-9611e0fcc33c" }))
}

async fn broken(
    State(captured): State<Captured>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, &'static str) {
    record(&captured, &headers, body);
    (StatusCode::UNAUTHORIZED, "invalid api key")
}

async fn serve() -> (Url, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route("/openai/v1/chat/completions", post(completion))
        .route("/emails", post(emails))
        .route("/broken", post(broken))
        .with_state(captured.clone());

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (Url::parse(&format!("http://{addr}/")).unwrap(), captured)
}

fn postings() -> Vec<Posting> {
    vec![Posting {
        title: "Développeur Symfony".into(),
        link: "https://www.bodet.com/offre/12".into(),
        company: "Bodet Software".into(),
        location: "Cholet".into(),
        observed_at: "2024-06-10 07:45".parse().unwrap(),
    }]
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn llm_renderer_sends_chat_request_and_strips_fences() {
    let (base, captured) = serve().await;
    let renderer = LlmRenderer::new("groq-key", "llama-3.3-70b-versatile")
        .unwrap()
        .with_endpoint(base.join("openai/v1/chat/completions").unwrap());

    let html = renderer.render(&postings()).await.unwrap();

    assert_eq!(html, "<html><body><p>Rendered</p></body></html>");

    let captured = captured.lock().unwrap();
    let (auth, body) = &captured[0];
    assert_eq!(auth, "Bearer groq-key");
    assert_eq!(body["model"], "llama-3.3-70b-versatile");
    assert_eq!(body["temperature"], 0.7);
    assert_eq!(body["top_p"], 0.95);
    assert_eq!(body["max_completion_tokens"], 4096);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["role"], "user");
    let prompt = body["messages"][1]["content"].as_str().unwrap();
    assert!(prompt.contains("Title: Développeur Symfony"));
    assert!(prompt.contains("Link: https://www.bodet.com/offre/12"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn llm_error_falls_back_to_basic_html() {
    let (base, captured) = serve().await;
    let formatter = Formatter::with_renderer(
        LlmRenderer::new("bad-key", "llama-3.3-70b-versatile")
            .unwrap()
            .with_endpoint(base.join("broken").unwrap()),
    );

    let html = formatter.format(&postings()).await;

    assert_eq!(captured.lock().unwrap().len(), 1);
    assert_eq!(html, basic_html(&postings()));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn resend_notifier_posts_email() {
    let (base, captured) = serve().await;
    let notifier = ResendNotifier::new("re_key", "onboarding@resend.dev", "me@example.com")
        .unwrap()
        .with_endpoint(base.join("emails").unwrap());

    notifier
        .send("[Kelio] 1 new developer job posting(s)", "<p>hi</p>")
        .await
        .unwrap();

    let captured = captured.lock().unwrap();
    let (auth, body) = &captured[0];
    assert_eq!(auth, "Bearer re_key");
    assert_eq!(
        *body,
        json!({
            "from": "onboarding@resend.dev",
            "to": ["me@example.com"],
            "subject": "[Kelio] 1 new developer job posting(s)",
            "html": "<p>hi</p>",
        })
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn resend_rejection_is_an_error() {
    let (base, _) = serve().await;
    let notifier = ResendNotifier::new("re_key", "onboarding@resend.dev", "me@example.com")
        .unwrap()
        .with_endpoint(base.join("broken").unwrap());

    let err = notifier.send("subject", "<p>hi</p>").await.unwrap_err();

    assert!(
        matches!(&err, NotifyError::Rejected { status, body } if status.as_u16() == 401 && body == "invalid api key"),
        "{err}"
    );
}
