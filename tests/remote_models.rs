use std::{
  collections::HashMap,
  io::{BufRead, BufReader, Read, Write},
  net::{TcpListener, TcpStream},
  thread::{self, JoinHandle},
  time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use huajia::{
  FromUrl,
  frame::Frame,
  model::{InferenceError, Model, ModelBuilder},
};
use image::{Rgb, RgbImage};
use url::Url;

/// 本地 HTTP 服务收到的一次请求
#[derive(Debug)]
struct Captured {
  method: String,
  path: String,
  headers: HashMap<String, String>,
  body: Vec<u8>,
}

struct Reply {
  status: u16,
  content_type: &'static str,
  body: String,
}

impl Reply {
  fn json(value: serde_json::Value) -> Self {
    Self {
      status: 200,
      content_type: "application/json",
      body: value.to_string(),
    }
  }

  fn text(status: u16, body: &str) -> Self {
    Self {
      status,
      content_type: "text/plain",
      body: body.to_string(),
    }
  }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<Captured> {
  stream.set_read_timeout(Some(Duration::from_secs(5)))?;
  let mut reader = BufReader::new(stream);

  let mut line = String::new();
  reader.read_line(&mut line)?;
  let mut parts = line.split_whitespace();
  let method = parts.next().unwrap_or_default().to_string();
  let path = parts.next().unwrap_or_default().to_string();

  let mut headers = HashMap::new();
  loop {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim_end();
    if line.is_empty() {
      break;
    }
    if let Some((k, v)) = line.split_once(':') {
      headers.insert(k.trim().to_lowercase(), v.trim().to_string());
    }
  }

  let len = headers
    .get("content-length")
    .and_then(|v| v.parse::<usize>().ok())
    .unwrap_or(0);
  let mut body = vec![0; len];
  reader.read_exact(&mut body)?;
  Ok(Captured {
    method,
    path,
    headers,
    body,
  })
}

fn write_reply(stream: &mut TcpStream, reply: &Reply) -> std::io::Result<()> {
  let reason = match reply.status {
    200 => "OK",
    404 => "Not Found",
    _ => "Internal Server Error",
  };
  write!(
    stream,
    "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    reply.status,
    reason,
    reply.content_type,
    reply.body.len(),
    reply.body
  )?;
  stream.flush()
}

/// 依次应答，每个连接一个请求
fn serve(listener: TcpListener, replies: Vec<Reply>) -> JoinHandle<Vec<Captured>> {
  thread::spawn(move || {
    let mut captured = Vec::new();
    for reply in replies {
      let (mut stream, _) = listener.accept().unwrap();
      captured.push(read_request(&mut stream).unwrap());
      write_reply(&mut stream, &reply).unwrap();
    }
    captured
  })
}

fn frame() -> Frame {
  Frame::new(RgbImage::from_pixel(8, 6, Rgb([200, 40, 90])), 3, 0)
}

fn predictions() -> serde_json::Value {
  serde_json::json!([
    {"class": "rose", "class_id": 0, "confidence": 0.92, "x": 4.0, "y": 3.0, "width": 2.0, "height": 2.0}
  ])
}

#[test]
fn workflow_posts_json_with_base64_image() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let server = serve(
    listener,
    vec![Reply::json(serde_json::json!({
      "outputs": [{"predictions": {"predictions": predictions()}}]
    }))],
  );

  let url = Url::parse(&format!(
    "workflow://127.0.0.1:{}/infer/workflows/garden/price?tls=false&api_key=secret",
    port
  ))
  .unwrap();
  let model = ModelBuilder::from_url(&url).unwrap().build().unwrap();
  let detections = model.infer(&frame()).unwrap();
  assert_eq!(detections.len(), 1);
  assert_eq!(detections[0].class, "rose");

  let requests = server.join().unwrap();
  let request = &requests[0];
  assert_eq!(request.method, "POST");
  assert!(request.path.starts_with("/infer/workflows/garden/price"));
  assert_eq!(request.headers["content-type"], "application/json");

  let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
  assert_eq!(body["api_key"], "secret");
  assert_eq!(body["inputs"]["image"]["type"], "base64");
  let value = body["inputs"]["image"]["value"].as_str().unwrap();
  let decoded = image::load_from_memory(&STANDARD.decode(value).unwrap()).unwrap();
  assert_eq!((decoded.width(), decoded.height()), (8, 6));
}

#[test]
fn workflow_error_responses_fail_the_request() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let server = serve(
    listener,
    vec![
      Reply::text(500, "boom"),
      Reply::text(200, "<html>not json</html>"),
      Reply::json(serde_json::json!({"outputs": []})),
    ],
  );

  let url = Url::parse(&format!(
    "workflow://127.0.0.1:{}/infer?tls=false&api_key=secret",
    port
  ))
  .unwrap();
  let model = ModelBuilder::from_url(&url).unwrap().build().unwrap();

  assert!(matches!(
    model.infer(&frame()),
    Err(InferenceError::Status(500, _))
  ));
  assert!(matches!(
    model.infer(&frame()),
    Err(InferenceError::Malformed(_))
  ));
  assert!(matches!(
    model.infer(&frame()),
    Err(InferenceError::Malformed(_))
  ));
  assert_eq!(server.join().unwrap().len(), 3);
}

#[test]
fn worker_recovers_after_retry() {
  // 先占用一个端口再释放，使首次初始化连接被拒绝
  let port = {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
  };
  let base = format!("http://127.0.0.1:{}", port);
  let url = Url::parse(&format!(
    "worker://florax-ai/4?key=pub&registry={}&detect={}",
    urlencoding::encode(&base),
    urlencoding::encode(&base)
  ))
  .unwrap();
  let model = ModelBuilder::from_url(&url).unwrap().build().unwrap();
  assert!(model.wait_ready(Duration::from_secs(10)).is_err());
  assert!(!model.is_ready());

  let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
  let server = serve(
    listener,
    vec![
      Reply::json(serde_json::json!({"model": {"id": "florax-ai/4"}})),
      Reply::json(serde_json::json!({"predictions": predictions()})),
    ],
  );

  model.retry_init().unwrap();
  model.wait_ready(Duration::from_secs(10)).unwrap();
  assert!(model.is_ready());

  let frame = frame();
  let detections = model.infer(&frame).unwrap();
  assert_eq!(detections[0].class_id, Some(0));

  let requests = server.join().unwrap();
  assert_eq!(requests[0].method, "GET");
  assert_eq!(requests[0].path, "/florax-ai/4?api_key=pub");
  assert_eq!(requests[1].method, "POST");
  assert_eq!(requests[1].path, "/florax-ai/4?api_key=pub");
  assert_eq!(
    requests[1].headers["content-type"],
    "application/x-www-form-urlencoded"
  );
  assert_eq!(requests[1].body, frame.to_base64().unwrap().into_bytes());
}
