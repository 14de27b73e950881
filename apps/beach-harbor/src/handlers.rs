//! Public HTTP surface used by clients and browsers.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use transport_webrtc_http::signal::{AnswerEnvelope, CLIENT_USER_AGENT, SESSION_COOKIE, SESSION_TOKEN_HEADER};
use url::Url;
use uuid::Uuid;

use crate::auth::{basic_credentials, cookie_value, BASIC_REALM};
use crate::error::{no_store, wants_json, ApiError};
use crate::state::Target;
use crate::token::TokenError;
use crate::AppState;

/// Query parameter that sends a browser to the instance's redirect address.
pub const REDIRECT_QUERY: &str = "x-harbor-redirect";
const MAX_ANSWER_BYTES: usize = 64 * 1024;
const BOOTSTRAP_PAGE: &str = include_str!("../assets/index.html");

pub async fn handle_http(State(app): State<AppState>, request: Request) -> Response {
    let json = wants_json(request.headers());
    let title = app.config.error_page_title.clone();
    match route(app, request, json).await {
        Ok(response) => response,
        Err(err) => err.render(json, &title),
    }
}

async fn route(app: AppState, request: Request, json: bool) -> Result<Response, ApiError> {
    let target = app
        .broker
        .target()
        .filter(|target| targets(&target.url, request.headers(), request.uri()))
        .ok_or_else(ApiError::no_pending)?;

    if let Some(redirect) = redirect_for(&target, request.uri()) {
        tracing::debug!(target = "harbor", to = %redirect, "redirecting client");
        return Ok(Redirect::to(&redirect).into_response());
    }

    match (json, request.method().clone()) {
        (true, Method::POST) => post_answer(&app, request.into_body()).await,
        (true, Method::GET) => get_offer(&app, request.headers()).await,
        (false, Method::GET | Method::HEAD) => get_page(&app, &target, request.headers()).await,
        _ => Err(ApiError::method_not_allowed()),
    }
}

/// Whether the request's host and path name the assigned URL.
fn targets(url: &Url, headers: &HeaderMap, uri: &Uri) -> bool {
    let authority = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()));
    let Some(authority) = authority else {
        return false;
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        None => (authority, None),
    };
    let bare = |host: &str| host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    let expected_port = url.port_or_known_default();
    let host_matches = url.host_str().is_some_and(|expected| bare(expected) == bare(host));
    let port_matches = port.or(expected_port) == expected_port;
    let path_matches = url.path().trim_end_matches('/') == uri.path().trim_end_matches('/');
    host_matches && port_matches && path_matches
}

fn redirect_for(target: &Target, uri: &Uri) -> Option<String> {
    let redirect = target.arrival.redirect.as_ref()?;
    let asked = uri.query().is_some_and(|query| {
        query
            .split('&')
            .any(|pair| pair.split('=').next() == Some(REDIRECT_QUERY))
    });
    (target.arrival.redirect_only || asked).then(|| redirect.clone())
}

async fn get_page(app: &AppState, target: &Target, headers: &HeaderMap) -> Result<Response, ApiError> {
    if app.broker.pending_session().is_some() {
        return Err(ApiError::no_pending());
    }

    if let Some(expected) = target.arrival.basic_auth.clone() {
        let Some((username, password)) = basic_credentials(headers) else {
            return Ok(unauthorized(app));
        };
        let verified = tokio::task::spawn_blocking(move || expected.verify(&username, &password))
            .await
            .unwrap_or(false);
        if !verified {
            tracing::debug!(target = "harbor", "rejected basic auth credentials");
            return Ok(unauthorized(app));
        }
    }

    let session_id = Uuid::new_v4().to_string();
    let token = app.tokens.issue(&session_id).map_err(|err| {
        tracing::error!(target = "harbor", error = %err, "failed to sign session token");
        ApiError::internal("Internal Server Error")
    })?;
    let cookie = format!(
        "{SESSION_COOKIE}={token}; Max-Age={}; Path=/; HttpOnly; SameSite=Strict",
        app.tokens.lifetime().as_secs()
    );
    let cookie = HeaderValue::from_str(&cookie).map_err(|_| ApiError::internal("Internal Server Error"))?;

    let from_cli = headers
        .get(header::USER_AGENT)
        .is_some_and(|agent| agent.as_bytes() == CLIENT_USER_AGENT.as_bytes());
    if from_cli {
        return Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)]).into_response());
    }
    Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)], no_store(), Html(BOOTSTRAP_PAGE)).into_response())
}

fn unauthorized(app: &AppState) -> Response {
    let mut response = ApiError::unauthorized().render(false, &app.config.error_page_title);
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(BASIC_REALM));
    response
}

async fn get_offer(app: &AppState, headers: &HeaderMap) -> Result<Response, ApiError> {
    let token = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| cookie_value(headers, SESSION_COOKIE))
        .ok_or_else(ApiError::invalid_token)?;
    let session_id = app.tokens.verify(&token).map_err(|err| match err {
        TokenError::Expired => ApiError::expired_token(),
        _ => ApiError::invalid_token(),
    })?;

    let (_ticket, reply) = app.broker.enqueue(session_id)?;
    let envelope = reply
        .await
        .map_err(|_| ApiError::internal("Internal Server Error"))??;
    Ok((no_store(), Json(envelope)).into_response())
}

async fn post_answer(app: &AppState, body: Body) -> Result<Response, ApiError> {
    if app.broker.pending_session().is_none() {
        return Err(ApiError::bad_request(
            "No pending session found",
            "Make sure a server is waiting for you before connecting.",
        ));
    }
    let invalid = || ApiError::bad_request("Invalid JSON", "Make sure you are sending valid JSON.");
    let body = to_bytes(body, MAX_ANSWER_BYTES).await.map_err(|_| invalid())?;
    let envelope: AnswerEnvelope = serde_json::from_slice(&body).map_err(|_| invalid())?;
    app.broker.submit_answer(envelope).await?;
    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use transport_webrtc_http::sdp::SdpKind;
    use transport_webrtc_http::signal::protocol::{BasicAuth, BrokerMessage};
    use transport_webrtc_http::signal::OfferEnvelope;
    use transport_webrtc_http::{IceConfiguration, SessionDescription};

    use super::*;
    use crate::config::Config;
    use crate::connection::{test_instance, ArrivalInfo, TestInstance};

    const OFFER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    fn app() -> AppState {
        let config = Config {
            jwt_secret: Some("test-secret".into()),
            ..Config::default()
        };
        AppState::new(config, IceConfiguration::stun_default()).expect("state")
    }

    fn attach(app: &AppState, arrival: ArrivalInfo) -> TestInstance {
        let instance = test_instance(arrival);
        app.broker
            .attach(instance.0.clone(), Url::parse("http://localhost:8080/").expect("url"))
            .expect("attach");
        instance
    }

    fn get(uri: &str) -> axum::http::request::Builder {
        HttpRequest::builder().uri(uri).header(header::HOST, "localhost:8080")
    }

    async fn send(app: &AppState, request: HttpRequest<Body>) -> Response {
        crate::http_router(app.clone()).oneshot(request).await.expect("response")
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    fn session_cookie(response: &Response) -> String {
        let cookie = response.headers()[header::SET_COOKIE].to_str().expect("cookie");
        let (pair, _) = cookie.split_once(';').expect("attributes");
        pair.to_string()
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn unknown_targets_are_not_found() {
        let app = app();
        let response = send(&app, get("/").body(Body::empty()).expect("request")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _instance = attach(&app, ArrivalInfo::default());
        let response = send(&app, get("/elsewhere").body(Body::empty()).expect("request")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = HttpRequest::builder()
            .uri("/")
            .header(header::HOST, "other-host:8080")
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .expect("request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).expect("json");
        assert_eq!(value["error"], "No pending session found");
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn redirects_when_asked_or_forced() {
        let optional = app();
        let _instance = attach(
            &optional,
            ArrivalInfo {
                redirect: Some("https://direct.example/".into()),
                ..ArrivalInfo::default()
            },
        );

        let response = send(&optional, get("/").body(Body::empty()).expect("request")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&optional, get("/?x-harbor-redirect").body(Body::empty()).expect("request")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "https://direct.example/");

        let forced = app();
        let _instance = attach(
            &forced,
            ArrivalInfo {
                redirect: Some("https://direct.example/".into()),
                redirect_only: true,
                ..ArrivalInfo::default()
            },
        );
        let response = send(&forced, get("/").body(Body::empty()).expect("request")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }

    #[test_timeout::tokio_timeout_test(60)]
    async fn basic_auth_guards_the_page() {
        let app = app();
        let _instance = attach(
            &app,
            ArrivalInfo {
                basic_auth: Some(BasicAuth::from_credentials("alice", "hunter2").expect("hash")),
                ..ArrivalInfo::default()
            },
        );

        let response = send(&app, get("/").body(Body::empty()).expect("request")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], BASIC_REALM);

        let wrong = base64_basic("alice", "nope");
        let response = send(
            &app,
            get("/").header(header::AUTHORIZATION, wrong).body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let right = base64_basic("alice", "hunter2");
        let response = send(
            &app,
            get("/").header(header::AUTHORIZATION, right).body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::SET_COOKIE));
    }

    fn base64_basic(user: &str, pass: &str) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn page_for_browsers_and_bare_ok_for_cli() {
        let app = app();
        let _instance = attach(&app, ArrivalInfo::default());

        let response = send(&app, get("/").body(Body::empty()).expect("request")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        let cookie = response.headers()[header::SET_COOKIE].to_str().expect("cookie").to_string();
        assert!(cookie.starts_with("session_token="));
        assert!(cookie.contains("Max-Age=10"));
        assert!(cookie.contains("HttpOnly"));
        assert!(body_text(response).await.contains("RTCPeerConnection"));

        let response = send(
            &app,
            get("/")
                .header(header::USER_AGENT, CLIENT_USER_AGENT)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::SET_COOKIE));
        assert!(body_text(response).await.is_empty());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn json_get_requires_a_valid_token() {
        let app = app();
        let _instance = attach(&app, ArrivalInfo::default());

        let response = send(
            &app,
            get("/")
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(
            &app,
            get("/")
                .header(header::ACCEPT, "application/json")
                .header(SESSION_TOKEN_HEADER, "garbage")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).expect("json");
        assert_eq!(value["error"], "Invalid Session Token");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offer_then_answer_through_the_queue() {
        let app = app();
        let (_instance, mut outbound, inbox) = attach(&app, ArrivalInfo::default());
        let cancel = CancellationToken::new();
        tokio::spawn(
            app.broker
                .clone()
                .run_worker(app.ice.as_ref().clone(), cancel.clone()),
        );

        let page = send(&app, get("/").body(Body::empty()).expect("request")).await;
        let cookie = session_cookie(&page);

        let instance_side = tokio::spawn(async move {
            let Some(BrokerMessage::GetOfferRequest { session_id, ice }) = outbound.recv().await else {
                panic!("expected an offer request");
            };
            assert!(ice.is_some());
            inbox
                .send(BrokerMessage::GetOfferResponse {
                    session_id: session_id.clone(),
                    offer: Some(SessionDescription {
                        kind: SdpKind::Offer,
                        sdp: OFFER_SDP.into(),
                    }),
                    error: None,
                })
                .expect("offer");
            let Some(BrokerMessage::GotAnswerRequest { session_id: answered, .. }) = outbound.recv().await
            else {
                panic!("expected the answer");
            };
            assert_eq!(answered, session_id);
            inbox
                .send(BrokerMessage::GotAnswerResponse {
                    session_id: answered,
                    error: None,
                })
                .expect("ack");
        });

        let response = send(
            &app,
            get("/")
                .header(header::ACCEPT, "application/json")
                .header(header::COOKIE, cookie.clone())
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let envelope: OfferEnvelope = serde_json::from_str(&body_text(response).await).expect("envelope");
        assert_eq!(envelope.description.sdp, OFFER_SDP);
        assert_eq!(app.broker.pending_session().as_deref(), Some(envelope.session_id.as_str()));

        // another client while the session is pending
        let page = send(
            &app,
            get("/")
                .header(header::USER_AGENT, CLIENT_USER_AGENT)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(page.status(), StatusCode::NOT_FOUND);
        let response = send(
            &app,
            get("/")
                .header(header::ACCEPT, "application/json")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let answer = |session_id: &str| {
            serde_json::to_string(&AnswerEnvelope {
                answer: SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: OFFER_SDP.into(),
                },
                session_id: session_id.to_string(),
            })
            .expect("json")
        };
        let post = |body: String| {
            get("/")
                .method(Method::POST)
                .header(header::ACCEPT, "application/json")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .expect("request")
        };

        let response = send(&app, post(answer("not-the-session"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.broker.pending_session().as_deref(), Some(envelope.session_id.as_str()));

        let response = send(&app, post("{".into())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&app, post(answer(&envelope.session_id))).await;
        assert_eq!(response.status(), StatusCode::OK);
        instance_side.await.expect("instance side");
        cancel.cancel();
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn post_without_pending_session_is_rejected() {
        let app = app();
        let _instance = attach(&app, ArrivalInfo::default());
        let response = send(
            &app,
            get("/")
                .method(Method::POST)
                .header(header::ACCEPT, "application/json")
                .body(Body::from("{}"))
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).expect("json");
        assert_eq!(value["error"], "No pending session found");
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn queue_overflow_is_unavailable() {
        let config = Config {
            jwt_secret: Some("test-secret".into()),
            max_client_queue_size: 0,
            ..Config::default()
        };
        let app = AppState::new(config, IceConfiguration::stun_default()).expect("state");
        let _instance = attach(&app, ArrivalInfo::default());
        let token = app.tokens.issue("s").expect("token");
        let response = send(
            &app,
            get("/")
                .header(header::ACCEPT, "application/json")
                .header(SESSION_TOKEN_HEADER, token)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
