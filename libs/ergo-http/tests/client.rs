#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end tests against a local mock server.

use ergo_http::{
    BasicAuth, BodyJson, BodyReader, BodyXml, DumpOptions, FileUpload, Header, Host, HttpClient,
    HttpClientBuilder, HttpClientConfig, HttpError, JsonEncodeOptions, Param, QueryParam,
    RequestContext, options,
};
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use httpmock::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;

fn test_client() -> HttpClient {
    HttpClientBuilder::with_config(HttpClientConfig::for_testing())
        .build()
        .unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn gzip_body_is_decoded_once_and_cached() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/gz");
        then.status(200)
            .header("content-encoding", "gzip")
            .header("content-type", "text/plain")
            .body(gzip(b"hello, compressed world"));
    });

    let client = test_client();
    let mut resp = client
        .get(&format!("{}/gz", server.base_url()), options![])
        .await
        .unwrap();

    assert_eq!(resp.text().await.unwrap(), "hello, compressed world");
    assert_eq!(resp.bytes().await.unwrap(), "hello, compressed world");
    assert_eq!(resp.limit_bytes(5).await.unwrap(), "hello");
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn deflate_body_is_decoded() {
    #[derive(Deserialize)]
    struct Item {
        id: u32,
        name: String,
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/deflate");
        then.status(200)
            .header("content-encoding", "deflate")
            .body(zlib(br#"{"id":7,"name":"roc"}"#));
    });

    let client = test_client();
    let mut resp = client
        .get(&format!("{}/deflate", server.base_url()), options![])
        .await
        .unwrap();
    let item: Item = resp.json().await.unwrap();
    assert_eq!(item.id, 7);
    assert_eq!(item.name, "roc");
}

#[tokio::test]
async fn gbk_page_is_converted_to_utf8() {
    let text = "<html><head><meta charset=\"gbk\"></head>\
        <body>\u{4f60}\u{597d}\u{ff0c}\u{4e16}\u{754c}</body></html>";
    let (encoded, _, had_errors) = encoding_rs::GBK.encode(text);
    assert!(!had_errors);

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/page");
        then.status(200)
            .header("content-type", "text/html")
            .body(encoded.into_owned());
    });

    let client = test_client();
    let mut resp = client
        .get(&format!("{}/page", server.base_url()), options![])
        .await
        .unwrap();
    assert_eq!(resp.charset().await.unwrap(), "gbk");
    assert_eq!(resp.text_utf8().await.unwrap(), text);
}

#[tokio::test]
async fn header_charset_is_used_without_meta() {
    let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode("\u{3053}\u{3093}\u{306b}\u{3061}\u{306f}");

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/sjis");
        then.status(200)
            .header("content-type", "text/plain; charset=Shift_JIS")
            .body(encoded.into_owned());
    });

    let client = test_client();
    let mut resp = client
        .get(&format!("{}/sjis", server.base_url()), options![])
        .await
        .unwrap();
    assert_eq!(resp.charset().await.unwrap(), "shift_jis");
    assert_eq!(
        resp.text_utf8().await.unwrap(),
        "\u{3053}\u{3093}\u{306b}\u{3061}\u{306f}"
    );
}

#[tokio::test]
async fn multipart_upload_reaches_server() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/upload")
            .body_includes("name=\"title\"")
            .body_includes("report")
            .body_includes("name=\"file\"; filename=\"notes.txt\"")
            .body_includes("Content-Type: text/plain")
            .body_includes("line one");
        then.status(201);
    });

    let client = test_client();
    let resp = client
        .post(
            &format!("{}/upload", server.base_url()),
            options![
                Param::from([("title", "report")]),
                FileUpload::from_bytes("file", "notes.txt", "line one")
                    .with_content_type("text/plain"),
            ],
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), http::StatusCode::CREATED);
    assert_eq!(mock.calls(), 1);

    let encoder = resp.multipart().unwrap();
    assert_eq!(encoder.bytes_uploaded(), 8);
    let framed = encoder.dump().unwrap().clone();
    let boundary = encoder.boundary().to_owned();
    let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(framed) });
    let mut parsed = multer::Multipart::new(stream, boundary);
    let field = parsed.next_field().await.unwrap().unwrap();
    assert_eq!(field.name(), Some("title"));
    assert_eq!(field.text().await.unwrap(), "report");
}

#[tokio::test]
async fn uploaded_file_from_disk_uses_media_field() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("photo.bin");
    std::fs::write(&path, [1_u8, 2, 3, 4]).unwrap();

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(PUT)
            .path("/media")
            .body_includes("name=\"media\"; filename=\"photo.bin\"")
            .body_includes("Content-Type: application/octet-stream");
        then.status(200);
    });

    let client = test_client();
    let upload = FileUpload::open(&path).await.unwrap();
    client
        .put(&format!("{}/media", server.base_url()), options![upload])
        .await
        .unwrap();
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn streamed_body_is_sent_and_partially_captured() {
    let server = MockServer::start();
    let payload = "0123456789".repeat(10);
    let mock = server.mock(|when, then| {
        when.method(POST).path("/stream").body(payload.as_str());
        then.status(200);
    });

    let client = HttpClientBuilder::with_config(HttpClientConfig::for_testing())
        .body_capture_limit(16)
        .build()
        .unwrap();
    let reader = BodyReader::with_len(std::io::Cursor::new(payload.clone().into_bytes()), 100);
    let resp = client
        .post(&format!("{}/stream", server.base_url()), options![reader])
        .await
        .unwrap();

    assert_eq!(mock.calls(), 1);
    assert_eq!(resp.request_body(), &payload.as_bytes()[..16]);
}

#[tokio::test]
async fn json_encoder_options_come_from_client() {
    #[derive(Serialize)]
    struct Note {
        text: String,
    }

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/notes")
            .header("content-type", "application/json; charset=UTF-8")
            .body("{\"text\":\"\\u003cb\\u003ebold\\u003c/b\\u003e\"}\n");
        then.status(200);
    });

    let client = HttpClientBuilder::with_config(HttpClientConfig::for_testing())
        .json_options(JsonEncodeOptions::default())
        .build()
        .unwrap();
    client
        .post(
            &format!("{}/notes", server.base_url()),
            options![BodyJson::new(Note {
                text: "<b>bold</b>".to_owned()
            })],
        )
        .await
        .unwrap();
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn xml_body_and_response() {
    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        id: u32,
    }

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/xml")
            .header("content-type", "application/xml; charset=UTF-8")
            .body_includes("<id>1</id>");
        then.status(200)
            .header("content-type", "application/xml")
            .body("<Ping><id>2</id></Ping>");
    });

    let client = test_client();
    let mut resp = client
        .post(
            &format!("{}/xml", server.base_url()),
            options![BodyXml::new(Ping { id: 1 })],
        )
        .await
        .unwrap();
    assert_eq!(resp.xml::<Ping>().await.unwrap(), Ping { id: 2 });
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn auth_host_and_query_options() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/secure")
            .query_param("page", "2")
            .header("authorization", "Basic dXNlcjpwYXNz")
            .header("host", "api.internal")
            .header("x-trace", "abc");
        then.status(200);
    });

    let client = test_client();
    let resp = client
        .get(
            &format!("{}/secure", server.base_url()),
            options![
                BasicAuth::new("user", "pass"),
                Host("api.internal".to_owned()),
                QueryParam::from([("page", 2)]),
                Header::from([("x-trace", "abc")]),
            ],
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn temporary_redirect_replays_post_body() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/old");
        then.status(307).header("location", "/new");
    });
    let target = server.mock(|when, then| {
        when.method(POST).path("/new").body("payload");
        then.status(200);
    });

    let client = test_client();
    let resp = client
        .post(&format!("{}/old", server.base_url()), options!["payload"])
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(target.calls(), 1);
}

#[tokio::test]
async fn host_override_does_not_follow_cross_origin_redirect() {
    let origin = MockServer::start();
    let other = MockServer::start();
    origin.mock(|when, then| {
        when.method(GET).path("/start").header("host", "vhost.internal");
        then.status(302).header("location", other.url("/landing"));
    });
    let leaked = other.mock(|when, then| {
        when.method(GET).path("/landing").header("host", "vhost.internal");
        then.status(500);
    });
    let landing = other.mock(|when, then| {
        when.method(GET)
            .path("/landing")
            .header("host", other.address().to_string());
        then.status(200);
    });

    let client = test_client();
    let resp = client
        .get(
            &format!("{}/start", origin.base_url()),
            options![Host("vhost.internal".to_owned())],
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(leaked.calls(), 0);
    assert_eq!(landing.calls(), 1);
}

#[tokio::test]
async fn to_file_streams_decoded_body() {
    let server = MockServer::start();
    let content = "row\n".repeat(1000);
    server.mock(|when, then| {
        when.method(GET).path("/export");
        then.status(200)
            .header("content-encoding", "gzip")
            .body(gzip(content.as_bytes()));
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.csv");

    let client = test_client();
    let mut resp = client
        .get(&format!("{}/export", server.base_url()), options![])
        .await
        .unwrap();
    resp.to_file(&path).await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    assert!(matches!(resp.bytes().await, Err(HttpError::BodyClosed)));
}

#[tokio::test]
async fn context_deadline_bounds_the_call() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(Duration::from_secs(5));
    });

    let client = test_client();
    let ctx = RequestContext::new().with_timeout(Duration::from_millis(100));
    let result = client
        .get(&format!("{}/slow", server.base_url()), options![ctx])
        .await;
    assert!(matches!(result, Err(HttpError::DeadlineExceeded(_))));
}

#[tokio::test]
async fn client_timeout_applies_without_context() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(Duration::from_secs(5));
    });

    let client = HttpClientBuilder::with_config(HttpClientConfig::for_testing())
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let result = client
        .get(&format!("{}/slow", server.base_url()), options![])
        .await;
    assert!(matches!(result, Err(HttpError::Timeout(_))));
}

#[tokio::test]
async fn head_response_with_encoding_has_empty_body() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("HEAD").path("/doc");
        then.status(200).header("content-encoding", "gzip");
    });

    let client = test_client();
    let mut resp = client
        .head(&format!("{}/doc", server.base_url()), options![])
        .await
        .unwrap();
    assert!(resp.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn free_functions_use_default_client() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(DELETE)
            .path("/items/1")
            .header("user-agent", ergo_http::DEFAULT_USER_AGENT);
        then.status(204);
    });

    let resp = ergo_http::delete(&format!("{}/items/1", server.base_url()), options![])
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::NO_CONTENT);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn dump_is_logged_when_configured() {
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Clone, Default)]
    struct DumpCapture {
        dumps: Arc<Mutex<Vec<String>>>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for DumpCapture {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if event.metadata().target() == "ergo_http::dump" {
                let mut visitor = MessageVisitor(String::new());
                event.record(&mut visitor);
                self.dumps.lock().unwrap().push(visitor.0);
            }
        }
    }

    struct MessageVisitor(String);
    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/echo");
        then.status(200).body("pong");
    });

    let capture = DumpCapture::default();
    let dumps = capture.dumps.clone();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture));

    let client = HttpClientBuilder::with_config(HttpClientConfig::for_testing())
        .dump(DumpOptions::ALL)
        .build()
        .unwrap();
    let mut resp = client
        .post(&format!("{}/echo", server.base_url()), options!["ping"])
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "pong");

    let dumps = dumps.lock().unwrap();
    assert_eq!(dumps.len(), 1);
    assert!(dumps[0].contains("> POST /echo"));
    assert!(dumps[0].contains("ping"));
    assert!(dumps[0].contains("< HTTP/1.1 200 OK"));
    assert!(dumps[0].contains("pong"));
}
