//! Small shared helpers.

use std::net::IpAddr;

use axum::http::HeaderMap;

/// Best-effort client address: first entry of `X-Forwarded-For`, then
/// `X-Real-IP`, then the socket peer address.
pub fn extract_client_ip(headers: &HeaderMap, direct_ip: Option<IpAddr>) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded_for.to_str() {
            // X-Forwarded-For can hold a chain: "client, proxy1, proxy2"
            let first_ip = forwarded_str.split(',').next().unwrap_or("").trim();
            if let Ok(ip) = first_ip.parse::<IpAddr>() {
                return normalize_ip(ip);
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(real_ip_str) = real_ip.to_str() {
            if let Ok(ip) = real_ip_str.trim().parse::<IpAddr>() {
                return normalize_ip(ip);
            }
        }
    }

    if let Some(ip) = direct_ip {
        return normalize_ip(ip);
    }

    "unknown".to_string()
}

/// Strip IPv6 brackets and render a canonical textual form.
fn normalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6.to_string(),
    }
}
