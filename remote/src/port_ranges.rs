use anyhow::{Context, anyhow};

/// Ports a portal listener may bind to.
#[derive(Debug, Clone)]
pub struct PortRanges {
    ranges: Vec<std::ops::RangeInclusive<u16>>,
}

fn parse_port(text: &str) -> anyhow::Result<u16> {
    let port: u16 = text
        .trim()
        .parse()
        .with_context(|| format!("invalid port {text:?}"))?;
    if port == 0 {
        return Err(anyhow!("port 0 cannot be part of a port range"));
    }
    Ok(port)
}

impl PortRanges {
    /// Parse a comma separated list of ports and inclusive ranges, e.g. "20000-20199,21000".
    pub fn parse(ranges_str: &str) -> anyhow::Result<Self> {
        let ranges = ranges_str
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let (first, last) = match item.split_once('-') {
                    Some((first, last)) => (parse_port(first)?, parse_port(last)?),
                    None => {
                        let port = parse_port(item)?;
                        (port, port)
                    }
                };
                if first > last {
                    return Err(anyhow!("port range {item:?} ends before it starts"));
                }
                Ok(first..=last)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        if ranges.is_empty() {
            return Err(anyhow!("no ports in {ranges_str:?}"));
        }
        Ok(Self { ranges })
    }

    fn shuffled_ports(&self) -> Vec<u16> {
        use rand::seq::SliceRandom;
        let mut all_ports: Vec<u16> = self.ranges.iter().flat_map(|range| range.clone()).collect();
        // random order so concurrent listeners rarely collide
        all_ports.shuffle(&mut rand::rng());
        all_ports
    }

    /// Bind a TCP listener to some port within the ranges, trying ports in random order.
    ///
    /// Gives up after `max_duration` (overridable with `REPLMOVER_TCP_BIND_MAX_DURATION_SECONDS`).
    pub async fn bind_tcp_listener(
        &self,
        ip: std::net::IpAddr,
        max_duration: std::time::Duration,
    ) -> anyhow::Result<tokio::net::TcpListener> {
        let max_duration = match std::env::var("REPLMOVER_TCP_BIND_MAX_DURATION_SECONDS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(secs) => {
                tracing::debug!("TCP bind deadline overridden from environment: {secs}s");
                std::time::Duration::from_secs(secs)
            }
            None => max_duration,
        };
        let started = std::time::Instant::now();
        let mut attempts = 0usize;
        let mut last_error = None;
        for port in self.shuffled_ports() {
            if started.elapsed() > max_duration {
                tracing::warn!(
                    "giving up on port ranges after {} bind attempts in {:?}",
                    attempts,
                    started.elapsed()
                );
                break;
            }
            attempts += 1;
            let addr = std::net::SocketAddr::new(ip, port);
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    tracing::info!("portal listener bound to {} after {} attempts", addr, attempts);
                    return Ok(listener);
                }
                Err(err) => {
                    tracing::debug!("cannot bind {}: {}", addr, err);
                    // back off briefly every few collisions so concurrent binders spread out
                    if err.kind() == std::io::ErrorKind::AddrInUse && attempts % 10 == 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(anyhow!(
            "Failed to bind TCP to any port in {:?} after {} attempts in {:?}: {}",
            self.ranges,
            attempts,
            started.elapsed(),
            last_error.map_or_else(|| "no ports available".to_string(), |err| err.to_string())
        ))
    }
}
