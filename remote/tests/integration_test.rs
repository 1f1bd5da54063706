use anyhow::Result;
use remote::port_ranges::PortRanges;

fn localhost() -> std::net::IpAddr {
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

#[tokio::test]
async fn test_port_binding_with_ranges() -> Result<()> {
    // use a unique range per test to avoid parallel test conflicts
    let ranges = PortRanges::parse("20000-20999")?;
    let listener = ranges
        .bind_tcp_listener(localhost(), std::time::Duration::from_secs(5))
        .await?;
    let addr = listener.local_addr()?;
    assert!(
        addr.port() >= 20000 && addr.port() <= 20999,
        "Port {} should be within range 20000-20999",
        addr.port()
    );
    Ok(())
}

#[tokio::test]
async fn test_multiple_port_ranges() -> Result<()> {
    let ranges = PortRanges::parse("23000-23099,23200-23299,23500")?;
    let listener = ranges
        .bind_tcp_listener(localhost(), std::time::Duration::from_secs(5))
        .await?;
    let port = listener.local_addr()?.port();
    assert!(
        (23000..=23099).contains(&port) || (23200..=23299).contains(&port) || port == 23500,
        "Port {port} should be within one of the ranges"
    );
    Ok(())
}

#[tokio::test]
async fn test_exhausted_range_fails() -> Result<()> {
    let ranges = PortRanges::parse("24000")?;
    let _held = ranges
        .bind_tcp_listener(localhost(), std::time::Duration::from_secs(5))
        .await?;
    let err = ranges
        .bind_tcp_listener(localhost(), std::time::Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Failed to bind TCP"));
    Ok(())
}

#[tokio::test]
async fn test_portal_server_listens_inside_port_ranges() -> Result<()> {
    let config = common::TransferConfig {
        port_ranges: Some("25000-25999".to_string()),
        ..Default::default()
    };
    let server = remote::PortalServer::new(config, None)?;
    let listener = server.listen(localhost()).await?;
    let port = listener.portal_addr()?.addr.port();
    assert!(
        (25000..=25999).contains(&port),
        "Port {port} should be within range 25000-25999"
    );
    Ok(())
}
