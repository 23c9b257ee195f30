//! Wallet JSON-RPC client used by v5+ mining: the wallet constructs a stake
//! transaction that replaces the template's coinbase.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum RpcError {
    Connect(String),
    Io(String),
    Http(String),
    Protocol(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Connect(message) => write!(f, "connect: {message}"),
            RpcError::Io(message) => write!(f, "io: {message}"),
            RpcError::Http(message) => write!(f, "http: {message}"),
            RpcError::Protocol(message) => write!(f, "rpc: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Clone, Debug, Serialize)]
pub struct ConstructStakeTxRequest {
    pub address: String,
    pub stake: u64,
    pub reward: u64,
    pub unlock_time: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConstructStakeTxResponse {
    pub tx_as_hex: String,
    pub tx_key: String,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'static str,
    params: &'a ConstructStakeTxRequest,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<ConstructStakeTxResponse>,
    error: Option<JsonRpcError>,
}

pub async fn construct_stake_tx(
    host: &str,
    port: u16,
    request: &ConstructStakeTxRequest,
) -> Result<ConstructStakeTxResponse, RpcError> {
    let envelope = JsonRpcRequest {
        jsonrpc: "2.0",
        id: "0",
        method: "construct_stake_tx",
        params: request,
    };
    let body = serde_json::to_vec(&envelope).map_err(|err| RpcError::Protocol(err.to_string()))?;

    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|err| RpcError::Connect(err.to_string()))?;

    let header = format!(
        "POST /json_rpc HTTP/1.1\r\nHost: {host}:{port}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream
        .write_all(header.as_bytes())
        .await
        .map_err(|err| RpcError::Io(err.to_string()))?;
    stream
        .write_all(&body)
        .await
        .map_err(|err| RpcError::Io(err.to_string()))?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .map_err(|err| RpcError::Io(err.to_string()))?;

    let response_body = split_http_body(&raw)?;
    let response: JsonRpcResponse = serde_json::from_slice(response_body)
        .map_err(|err| RpcError::Protocol(format!("malformed response: {err}")))?;
    if let Some(error) = response.error {
        return Err(RpcError::Protocol(format!(
            "wallet error {}: {}",
            error.code, error.message
        )));
    }
    response
        .result
        .ok_or_else(|| RpcError::Protocol("response carries neither result nor error".into()))
}

fn split_http_body(raw: &[u8]) -> Result<&[u8], RpcError> {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| RpcError::Http("missing header terminator".into()))?;
    let (head, body) = raw.split_at(split + 4);
    let status_line = head
        .split(|byte| *byte == b'\r')
        .next()
        .unwrap_or_default();
    let status = std::str::from_utf8(status_line)
        .map_err(|_| RpcError::Http("non-utf8 status line".into()))?;
    if !status.contains("200") {
        return Err(RpcError::Http(format!("unexpected status: {status}")));
    }
    Ok(body)
}

pub fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let text = std::str::from_utf8(chunk).ok()?;
        out.push(u8::from_str_radix(text, 16).ok()?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_decoding() {
        assert_eq!(hex_to_bytes("0001ff"), Some(vec![0x00, 0x01, 0xff]));
        assert_eq!(hex_to_bytes("0x"), None);
        assert_eq!(hex_to_bytes("abc"), None);
        assert_eq!(hex_to_bytes(""), Some(Vec::new()));
    }

    #[test]
    fn http_body_extraction() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}";
        assert_eq!(split_http_body(raw).expect("body"), b"{}");

        let raw = b"HTTP/1.1 404 Not Found\r\n\r\n";
        assert!(split_http_body(raw).is_err());
    }

    #[test]
    fn rpc_response_parsing() {
        let ok: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"0","result":{"tx_as_hex":"00","tx_key":"ab"}}"#,
        )
        .expect("parse");
        assert!(ok.error.is_none());
        assert_eq!(ok.result.expect("result").tx_as_hex, "00");

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"0","error":{"code":-5,"message":"no funds"}}"#,
        )
        .expect("parse");
        assert_eq!(err.error.expect("error").code, -5);
    }
}
