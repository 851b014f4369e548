use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use stenosis_screen::report::{
    ApiKey, ChatCompletionClient, FallbackTemplates, LlmSettings, ReportGenerator, DISCLAIMER,
};
use stenosis_screen::{Analyzer, Detection, ReportSource, Severity, StubBackend, UploadedImage};

struct CapturedRequest {
    head: String,
    body: serde_json::Value,
}

fn read_http_request(stream: &mut TcpStream) -> CapturedRequest {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf).expect("read request");
        assert!(n > 0, "client closed early");
        data.extend_from_slice(&buf[..n]);
    };
    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = data.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf).expect("read body");
        assert!(n > 0, "client closed early");
        body.extend_from_slice(&buf[..n]);
    }
    CapturedRequest {
        head,
        body: serde_json::from_slice(&body).expect("json request body"),
    }
}

/// Serve exactly one chat-completions request with a fixed status and body.
fn fake_chat_service(
    status_line: &'static str,
    response: String,
) -> (SocketAddr, mpsc::Receiver<CapturedRequest>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake service");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::channel();
    let join = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let request = read_http_request(&mut stream);
        let reply = format!(
            "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            response.len(),
            response
        );
        stream.write_all(reply.as_bytes()).expect("write reply");
        let _ = tx.send(request);
    });
    (addr, rx, join)
}

fn client_for(addr: SocketAddr, timeout: Duration) -> ChatCompletionClient {
    let settings = LlmSettings {
        base_url: format!("http://{addr}/openai/v1"),
        model: "test-model".to_string(),
        timeout,
    };
    ChatCompletionClient::new(&settings, ApiKey::new("gsk_test").unwrap()).unwrap()
}

fn chat_reply(content: &str) -> String {
    serde_json::json!({
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    })
    .to_string()
}

fn scan() -> UploadedImage {
    UploadedImage::new("patient scan.png", b"png bytes".to_vec()).unwrap()
}

#[test]
fn generated_report_flows_through_pipeline() {
    let completion = "```markdown\n## Executive Summary\nOne focal narrowing.\n\n## Recommendations\n- Cardiology referral\n```";
    let (addr, captured, join) = fake_chat_service("HTTP/1.1 200 OK", chat_reply(completion));

    let analyzer = Analyzer::with_backend(
        StubBackend::with_detections(vec![Detection::new(100.0, 100.0, 130.0, 120.0, 0.8)]),
        ReportGenerator::new(Box::new(client_for(addr, Duration::from_secs(5)))),
    )
    .with_annotation(false);

    let result = analyzer.analyze(&scan()).expect("analysis");
    join.join().unwrap();

    assert_eq!(result.image.file_name, "patient_scan.png");
    assert_eq!(result.findings.len(), 1);
    assert_eq!(result.findings[0].bounding_box.0, [100, 100, 130, 120]);
    assert_eq!(result.severity.severity, Severity::Severe);
    assert_eq!(result.report.source, ReportSource::Generated);
    assert!(result.report.markdown.starts_with("## Executive Summary"));
    assert!(!result.report.markdown.contains("```"));
    assert!(result.report.markdown.trim_end().ends_with(DISCLAIMER));

    let request = captured.recv().unwrap();
    assert!(request.head.starts_with("POST /openai/v1/chat/completions"));
    assert!(request
        .head
        .lines()
        .any(|line| line.eq_ignore_ascii_case("authorization: Bearer gsk_test")));
    assert_eq!(request.body["model"], "test-model");
    let messages = request.body["messages"].as_array().unwrap();
    assert_eq!(messages[0]["role"], "system");
    let user = messages[1]["content"].as_str().unwrap();
    assert!(user.contains("\"condition\": \"Stenosis\""));
    assert!(user.contains("severe severity"));
}

#[test]
fn service_error_falls_back_to_detected_template() {
    let (addr, _captured, join) = fake_chat_service(
        "HTTP/1.1 500 Internal Server Error",
        r#"{"error":"overloaded"}"#.to_string(),
    );
    let analyzer = Analyzer::with_backend(
        StubBackend::with_detections(vec![Detection::new(0.0, 0.0, 4.0, 4.0, 0.6)]),
        ReportGenerator::new(Box::new(client_for(addr, Duration::from_secs(5)))),
    )
    .with_annotation(false);

    let result = analyzer.analyze(&scan()).expect("analysis");
    join.join().unwrap();

    assert_eq!(result.report.source, ReportSource::Fallback);
    assert_eq!(result.report.markdown, FallbackTemplates::default().detected());
}

#[test]
fn headingless_completion_falls_back_to_healthy_template() {
    let (addr, _captured, join) =
        fake_chat_service("HTTP/1.1 200 OK", chat_reply("Looks fine to me."));
    let analyzer = Analyzer::with_backend(
        StubBackend::new(),
        ReportGenerator::new(Box::new(client_for(addr, Duration::from_secs(5)))),
    )
    .with_annotation(false);

    let result = analyzer.analyze(&scan()).expect("analysis");
    join.join().unwrap();

    assert_eq!(result.severity.severity, Severity::Healthy);
    assert_eq!(result.report.source, ReportSource::Fallback);
    assert_eq!(result.report.markdown, FallbackTemplates::default().healthy());
}

#[test]
fn unresponsive_service_times_out_to_fallback() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_secs(3));
        drop(stream);
    });

    let analyzer = Analyzer::with_backend(
        StubBackend::with_detections(vec![Detection::new(0.0, 0.0, 10.0, 10.0, 0.7)]),
        ReportGenerator::new(Box::new(client_for(addr, Duration::from_millis(500)))),
    )
    .with_annotation(false);

    let started = std::time::Instant::now();
    let result = analyzer.analyze(&scan()).expect("analysis");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result.report.source, ReportSource::Fallback);
    assert_eq!(result.report.markdown, FallbackTemplates::default().detected());
    hold.join().unwrap();
}
