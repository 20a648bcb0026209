use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::marker::Unpin;
use tokio::io::AsyncRead;

use super::connection::Connection;
use super::defs;
use super::error::Error;
use super::settings::Settings;

/// Decoded SCGI header block. Keys are unique, the last value wins.
pub type Header = BTreeMap<String, String>;

/// Read the netstring framed header block from the connection.
///
/// Framing is `<length>:<name>\0<value>\0...,`. Exactly `length + 1`
/// bytes are consumed after the colon; anything read beyond that stays
/// buffered in the connection.
pub async fn read_header<S>(conn: &mut Connection<S>, settings: &Settings)
                            -> Result<Header, Error>
    where S: AsyncRead + Unpin
{
    let max_digits = settings.max_header_size.to_string().len();
    let colon = loop {
        if let Some(pos) = conn.buffered().iter().position(|&b| b == b':') {
            break pos;
        }
        if conn.buffered().len() > max_digits {
            return Err(Error::InvalidHeader);
        }
        if conn.fill(defs::SCGI_LENGTH_CHUNK).await? == 0 {
            return Err(Error::UnexpectedEnd);
        }
    };
    let prefix = conn.read_exact_bytes(colon + 1).await?;
    let length = parse_length(&prefix[..colon])?;
    if length == 0 || length > settings.max_header_size {
        return Err(Error::InvalidHeader);
    }
    let block_len = length.checked_add(1).ok_or(Error::InvalidHeader)?;
    let block = conn.read_exact_bytes(block_len).await?;
    parse_header(&block)
}

fn parse_length(digits: &[u8]) -> Result<usize, Error>
{
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::InvalidHeader);
    }
    std::str::from_utf8(digits).ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(Error::InvalidHeader)
}

/// Parse the name/value section followed by the terminating comma.
pub fn parse_header(block: &[u8]) -> Result<Header, Error>
{
    let (section, end) = match block.split_last() {
        Some((&end, section)) => (section, end),
        None => return Err(Error::UnexpectedEnd)
    };
    if end != defs::SCGI_HEADER_END {
        return Err(Error::UnexpectedEnd);
    }
    let mut header = Header::new();
    let mut name: Option<String> = None;
    let mut rest = section;
    while !rest.is_empty() {
        let zero = match rest.iter().position(|&b| b == 0) {
            Some(zero) => zero,
            None => return Err(Error::UnexpectedEnd)
        };
        let token = std::str::from_utf8(&rest[..zero])
            .map_err(|_| Error::InvalidHeader)?
            .to_string();
        match name.take() {
            None => name = Some(token),
            Some(n) => {
                header.insert(n, token);
            }
        }
        rest = &rest[zero + 1..];
    }
    if name.is_some() {
        // name without a value
        return Err(Error::UnexpectedEnd);
    }
    Ok(header)
}

/// Encode name/value pairs as an SCGI header block
pub fn encode_header<N, V>(pairs: &[(N, V)]) -> Bytes
    where N: AsRef<[u8]>, V: AsRef<[u8]>
{
    let length: usize = pairs.iter()
        .map(|(n, v)| n.as_ref().len() + v.as_ref().len() + 2)
        .sum();
    let prefix = length.to_string();
    let mut buf = BytesMut::with_capacity(prefix.len() + length + 2);
    buf.put_slice(prefix.as_bytes());
    buf.put_u8(b':');
    for (n, v) in pairs {
        buf.put_slice(n.as_ref());
        buf.put_u8(0);
        buf.put_slice(v.as_ref());
        buf.put_u8(0);
    }
    buf.put_u8(defs::SCGI_HEADER_END);
    buf.freeze()
}

#[cfg(test)]
use tokio::runtime::Runtime;
#[cfg(test)]
use tokio::io::AsyncReadExt;

#[cfg(test)]
fn decode(input: &[u8], settings: &Settings) -> (Result<Header, Error>, Vec<u8>)
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut conn = Connection::new(input, settings);
        let res = read_header(&mut conn, settings).await;
        let left = conn.buffered().to_vec();
        let mut rest = Vec::new();
        conn.into_inner().read_to_end(&mut rest).await.unwrap();
        (res, [left, rest].concat())
    })
}

#[test]
fn test_header_round_trip()
{
    let pairs = [("CONTENT_LENGTH", "5"),
                 ("SCGI", "1"),
                 ("REQUEST_METHOD", "POST"),
                 ("REQUEST_URI", "/deepthought"),
                 ("EMPTY", "")];
    let encoded = encode_header(&pairs);
    let body = b"hello";
    let input = [&encoded[..], &body[..]].concat();
    let (res, rest) = decode(&input, &Settings::new());
    let header = res.unwrap();
    assert_eq!(header.len(), pairs.len());
    for (n, v) in pairs.iter() {
        assert_eq!(header.get(*n).map(String::as_str), Some(*v));
    }
    // the decoder consumed exactly the header block
    assert_eq!(rest, body);
}

#[test]
fn test_header_known_bytes()
{
    let input = b"70:CONTENT_LENGTH\x0056\x00SCGI\x001\x00REQUEST_METHOD\x00POST\x00REQUEST_URI\x00/deepthought\x00,What";
    let (res, rest) = decode(input, &Settings::new());
    let header = res.unwrap();
    assert_eq!(header["REQUEST_URI"], "/deepthought");
    assert_eq!(header["CONTENT_LENGTH"], "56");
    assert_eq!(rest, b"What");
    assert_eq!(encode_header(&[("CONTENT_LENGTH", "56"), ("SCGI", "1"),
                               ("REQUEST_METHOD", "POST"),
                               ("REQUEST_URI", "/deepthought")])[..],
               input[..input.len() - 4]);
}

#[test]
fn test_header_fragmented()
{
    let encoded = encode_header(&[("REQUEST_METHOD", "GET"),
                                  ("REQUEST_URI", "/")]);
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let (a, b) = encoded.split_at(1);
        let (b, c) = b.split_at(9);
        let input = a.chain(b).chain(c);
        let settings = Settings::new();
        let mut conn = Connection::new(input, &settings);
        let header = read_header(&mut conn, &settings).await.unwrap();
        assert_eq!(header["REQUEST_URI"], "/");
    });
}

#[test]
fn test_header_last_write_wins()
{
    let header = parse_header(b"A\x001\x00A\x002\x00,").unwrap();
    assert_eq!(header.len(), 1);
    assert_eq!(header["A"], "2");
}

#[test]
fn test_header_size_limits()
{
    let settings = Settings{max_header_size: 16, ..Settings::new()};
    let (res, _) = decode(b"17:AAAAAAAAAAAAAAAAAA,", &settings);
    assert!(matches!(res, Err(Error::InvalidHeader)));
    let (res, _) = decode(b"0:,", &settings);
    assert!(matches!(res, Err(Error::InvalidHeader)));
    // more digits than the limit can have
    let (res, _) = decode(b"000000016:", &settings);
    assert!(matches!(res, Err(Error::InvalidHeader)));
    let (res, _) = decode(b"1a:x\x00,", &settings);
    assert!(matches!(res, Err(Error::InvalidHeader)));
    let (res, _) = decode(b":x\x00y\x00,", &settings);
    assert!(matches!(res, Err(Error::InvalidHeader)));
}

#[test]
fn test_header_length_overflow()
{
    let settings = Settings{max_header_size: usize::MAX, ..Settings::new()};
    let input = format!("{}:", usize::MAX);
    let (res, _) = decode(input.as_bytes(), &settings);
    assert!(matches!(res, Err(Error::InvalidHeader)));
}

#[test]
fn test_header_truncated()
{
    let settings = Settings::new();
    // final token not null terminated
    let (res, _) = decode(b"3:A\x00B,", &settings);
    assert!(matches!(res, Err(Error::UnexpectedEnd)));
    // name without value
    let (res, _) = decode(b"2:A\x00,", &settings);
    assert!(matches!(res, Err(Error::UnexpectedEnd)));
    // no comma at the declared offset
    let (res, _) = decode(b"4:A\x00B\x00;", &settings);
    assert!(matches!(res, Err(Error::UnexpectedEnd)));
    // stream ends inside the block
    let (res, _) = decode(b"10:A\x00B\x00", &settings);
    assert!(matches!(res, Err(Error::UnexpectedEnd)));
    // stream ends before the colon
    let (res, _) = decode(b"12", &settings);
    assert!(matches!(res, Err(Error::UnexpectedEnd)));
}
