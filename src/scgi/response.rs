use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::borrow::Cow;
use std::marker::Unpin;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::cookie::Cookie;
use super::defs;
use super::error::Error;

/// Reply written back to the front-end server.
///
/// Built by a handler with the consuming `with_*` methods and encoded
/// once by the server.
#[derive(Debug, Clone)]
pub struct Response
{
    status: Cow<'static, str>,
    content_type: Cow<'static, str>,
    content: Bytes,
    headers: Vec<(Cow<'static, str>, String)>
}

pub static RESP_NOT_FOUND: Response = Response::fixed(defs::RESP_CODE_NOT_FOUND);
pub static RESP_BAD_REQUEST: Response = Response::fixed(defs::RESP_CODE_BAD_REQUEST);
pub static RESP_INTERNAL_ERROR: Response =
    Response::fixed(defs::RESP_CODE_INTERNAL_ERROR);

impl Response
{
    pub fn new<S, T, B>(status: S, content_type: T, content: B) -> Response
        where S: Into<Cow<'static, str>>,
              T: Into<Cow<'static, str>>,
              B: Into<Bytes>
    {
        Response{status: status.into(),
                 content_type: content_type.into(),
                 content: content.into(),
                 headers: Vec::new()}
    }

    /// Plain text response whose body is its own status line
    const fn fixed(status: &'static str) -> Response
    {
        Response{status: Cow::Borrowed(status),
                 content_type: Cow::Borrowed(defs::RESP_TYPE_TEXT),
                 content: Bytes::from_static(status.as_bytes()),
                 headers: Vec::new()}
    }

    pub fn ok<T, B>(content_type: T, content: B) -> Response
        where T: Into<Cow<'static, str>>, B: Into<Bytes>
    {
        Response::new(defs::RESP_CODE_OK, content_type, content)
    }

    pub fn json<S, V>(status: S, value: &V) -> Result<Response, serde_json::Error>
        where S: Into<Cow<'static, str>>, V: Serialize + ?Sized
    {
        let body = serde_json::to_vec(value)?;
        Ok(Response::new(status, defs::RESP_TYPE_JSON, body))
    }

    /// Add an extra header line
    pub fn with_header<N, V>(mut self, name: N, value: V) -> Response
        where N: Into<Cow<'static, str>>, V: Into<String>
    {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_cookie(self, cookie: &Cookie) -> Response
    {
        self.with_header("Set-Cookie", cookie.to_string())
    }

    pub fn status(&self) -> &str
    {
        &self.status
    }

    pub fn content_type(&self) -> &str
    {
        &self.content_type
    }

    pub fn content(&self) -> &Bytes
    {
        &self.content
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)>
    {
        self.headers.iter().map(|(n, v)| (&**n, v.as_str()))
    }

    /// Status, content type, optional length and extra headers, ending
    /// with the blank line
    pub fn encode_head(&self) -> BytesMut
    {
        let mut head = BytesMut::with_capacity(128);
        head.put_slice(b"Status: ");
        head.put_slice(self.status.as_bytes());
        head.put_slice(b"\r\nContent-Type: ");
        head.put_slice(self.content_type.as_bytes());
        head.put_slice(b"\r\n");
        if !self.content.is_empty() {
            head.put_slice(b"Content-Length: ");
            head.put_slice(self.content.len().to_string().as_bytes());
            head.put_slice(b"\r\n");
        }
        for (name, value) in &self.headers {
            head.put_slice(name.as_bytes());
            head.put_slice(b": ");
            for b in value.bytes() {
                head.put_u8(if b == b'\r' || b == b'\n' {b' '} else {b});
            }
            head.put_slice(b"\r\n");
        }
        head.put_slice(b"\r\n");
        head
    }

    /// Write the response. The deadline is armed once for the head and
    /// again for the body.
    pub async fn write<O>(&self, output: &mut O, deadline: Duration)
                          -> Result<(), Error>
        where O: AsyncWrite + Unpin
    {
        let head = self.encode_head();
        match timeout(deadline, output.write_all(&head)).await {
            Err(_) => return Err(Error::timeout("Write")),
            Ok(res) => res?
        }
        if !self.content.is_empty() {
            match timeout(deadline, output.write_all(&self.content)).await {
                Err(_) => return Err(Error::timeout("Write")),
                Ok(res) => res?
            }
        }
        match timeout(deadline, output.flush()).await {
            Err(_) => Err(Error::timeout("Write")),
            Ok(res) => Ok(res?)
        }
    }
}

#[cfg(test)]
use tokio::runtime::Runtime;

#[cfg(test)]
fn written(resp: &Response) -> Vec<u8>
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut out = Vec::new();
        resp.write(&mut out, Duration::from_secs(1)).await.unwrap();
        out
    })
}

#[test]
fn test_ok_response_bytes()
{
    let resp = Response::ok(defs::RESP_TYPE_TEXT, "ok");
    assert_eq!(written(&resp),
               b"Status: 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok".to_vec());
}

#[test]
fn test_empty_body_has_no_length()
{
    let resp = Response::new("204 No Content", defs::RESP_TYPE_TEXT, Bytes::new());
    assert_eq!(written(&resp),
               b"Status: 204 No Content\r\nContent-Type: text/plain\r\n\r\n".to_vec());
}

#[test]
fn test_headers_and_cookies()
{
    let resp = Response::new("302 Found", defs::RESP_TYPE_HTML, "")
        .with_header("Location", "/next\r\nX-Injected: 1")
        .with_cookie(&Cookie::new("a", "1").with_path("/"))
        .with_cookie(&Cookie::new("b", "2"));
    let out = String::from_utf8(written(&resp)).unwrap();
    assert_eq!(out,
               "Status: 302 Found\r\n\
                Content-Type: text/html\r\n\
                Location: /next  X-Injected: 1\r\n\
                Set-Cookie: a=1; Path=/\r\n\
                Set-Cookie: b=2\r\n\
                \r\n");
    assert_eq!(resp.headers().count(), 3);
}

#[test]
fn test_fixed_responses()
{
    assert_eq!(RESP_NOT_FOUND.status(), "404 Not found");
    assert_eq!(&RESP_NOT_FOUND.content()[..], b"404 Not found");
    assert_eq!(written(&RESP_BAD_REQUEST),
               b"Status: 400 Bad request\r\nContent-Type: text/plain\r\nContent-Length: 15\r\n\r\n400 Bad request".to_vec());
    assert_eq!(RESP_INTERNAL_ERROR.content_type(), "text/plain");
}

#[test]
fn test_json_response()
{
    let resp = Response::json(defs::RESP_CODE_OK,
                              &serde_json::json!({"path": "/x"})).unwrap();
    assert_eq!(resp.content_type(), "text/json");
    assert_eq!(&resp.content()[..], br#"{"path":"/x"}"#);
}

#[test]
fn test_write_timeout()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        // a tiny pipe nobody reads from
        let (mut writer, _reader) = tokio::io::duplex(4);
        let resp = Response::ok(defs::RESP_TYPE_TEXT, "a body longer than the pipe");
        let err = resp.write(&mut writer, Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_timeout());
    });
}
