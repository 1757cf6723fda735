//! 批量导入导出的行格式
//!
//! 每行一个代理: `[scheme://]host:port[:username:password]`，
//! IPv6 地址写在方括号中。空行和 `#` 开头的注释行被忽略。

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proxy::{host_port, Proxy, ProxyKind, ProxySpec};

/// 行错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineErrorKind {
    Malformed,
    Duplicate,
}

/// 某一行的导入错误，行号从 1 开始
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineError {
    pub line: usize,
    pub kind: LineErrorKind,
    pub reason: String,
}

/// 解析结果，错误只影响所在的行
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: Vec<(usize, ProxySpec)>,
    pub line_errors: Vec<LineError>,
}

/// 导入报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub line_errors: Vec<LineError>,
}

/// 解析多行文本
pub fn parse(raw: &str, default_kind: ProxyKind) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    for (index, line) in raw.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line, default_kind) {
            Ok(spec) => outcome.records.push((line_no, spec)),
            Err(e) => outcome.line_errors.push(LineError {
                line: line_no,
                kind: LineErrorKind::Malformed,
                reason: reason(e),
            }),
        }
    }
    outcome
}

/// 解析单行
pub fn parse_line(line: &str, default_kind: ProxyKind) -> Result<ProxySpec> {
    let (kind, rest) = match line.split_once("://") {
        Some((scheme, rest)) => (scheme.parse::<ProxyKind>()?, rest),
        None => (default_kind, line),
    };

    let (host, fields) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| malformed("unclosed '[' in host"))?;
        let fields = after
            .strip_prefix(':')
            .ok_or_else(|| malformed("expected ':' after ']'"))?;
        (host, fields.split(':').collect::<Vec<_>>())
    } else {
        let mut parts = rest.split(':');
        let host = parts.next().unwrap_or_default();
        (host, parts.collect::<Vec<_>>())
    };

    let (port, credentials) = match fields.as_slice() {
        [port] => (*port, None),
        [port, user, pass] => (*port, Some((*user, *pass))),
        _ => return Err(malformed("expected host:port or host:port:username:password")),
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| malformed(&format!("invalid port: {}", port)))?;

    let mut spec = ProxySpec::new(host, port).with_kind(kind);
    if let Some((user, pass)) = credentials {
        spec = spec.with_auth(user, pass);
    }
    spec.normalized()
}

/// 导出为文本，每条记录一行，以换行结尾
pub fn serialize(records: &[Proxy]) -> Result<String> {
    let mut out = String::new();
    for proxy in records {
        out.push_str(&format_line(proxy)?);
        out.push('\n');
    }
    Ok(out)
}

fn format_line(proxy: &Proxy) -> Result<String> {
    let invalid = |field: &str| {
        Error::Validation(format!("{} of proxy {} cannot be exported", field, proxy.id))
    };
    let unsafe_char = |c: char| c.is_whitespace() || c.is_control();

    if proxy.host.is_empty() || proxy.host.chars().any(unsafe_char) {
        return Err(invalid("host"));
    }
    if proxy.host.contains(':') && proxy.host.parse::<std::net::Ipv6Addr>().is_err() {
        return Err(invalid("host"));
    }

    // 总是带协议前缀，重新导入时不受默认类型影响
    let mut line = format!("{}://{}", proxy.kind.scheme(), host_port(&proxy.host, proxy.port));

    match (&proxy.username, &proxy.password) {
        (Some(user), Some(pass)) => {
            for (field, value) in [("username", user), ("password", pass)] {
                if value.is_empty() || value.contains(':') || value.chars().any(unsafe_char) {
                    return Err(invalid(field));
                }
            }
            line.push(':');
            line.push_str(user);
            line.push(':');
            line.push_str(pass);
        }
        (None, None) => {}
        _ => return Err(invalid("credentials")),
    }
    Ok(line)
}

fn malformed(reason: &str) -> Error {
    Error::Validation(reason.to_string())
}

fn reason(err: Error) -> String {
    match err {
        Error::Validation(reason) => reason,
        other => other.to_string(),
    }
}
