use anyhow::{anyhow, Context, Result};

/// Parsed readout destination (`tcp://host:port` or `host:port`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadoutEndpoint {
    pub host: String,
    pub port: u16,
}

impl ReadoutEndpoint {
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub fn parse_readout_endpoint(addr: &str) -> Result<ReadoutEndpoint> {
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        if scheme != "tcp" {
            return Err(anyhow!("unsupported readout scheme: {}", scheme));
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing readout host in {}", addr));
    }
    Ok(ReadoutEndpoint { host, port })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // Handle IPv6 addresses in brackets: [::1]:4002
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid readout address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing readout port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid readout port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing readout port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid readout port in {}", addr))?;
    Ok((host.to_string(), port))
}
