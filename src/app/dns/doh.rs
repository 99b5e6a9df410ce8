use std::{io, net::IpAddr};

use serde::Deserialize;

/// Minimal DNS-over-HTTPS client (RFC 8484 JSON form), used as a fallback
/// when the platform resolver fails (spec §4.6's DNS escalation path).
/// Grounded on `other_examples/e4221ece_sms1sis-https_dns_proxy_rust`, which
/// builds its upstream query the same way: plain `reqwest::Client` GET with
/// an `Accept: application/dns-json` header against a public DoH endpoint.
pub(crate) struct DohClient {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    data: String,
}

impl DohClient {
    pub(crate) fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: "https://cloudflare-dns.com/dns-query".to_string(),
        }
    }

    pub(crate) async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("name", host), ("type", "A")])
            .header("Accept", "application/dns-json")
            .send()
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
            .error_for_status()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
            .json::<DohResponse>()
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        resp.answer
            .iter()
            .find_map(|a| a.data.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no A records in DoH response"))
    }
}
