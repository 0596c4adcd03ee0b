//! Geolocation of probed servers
//!
//! Lookups are best-effort: private or unparseable addresses short-circuit to
//! a fixed marker without any outbound request, and backend failures map to
//! an "unknown" country instead of an error.

use crate::Result;
use maxminddb::{geoip2, Reader};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Country code used when the country is not known
pub const UNKNOWN_COUNTRY_CODE: &str = "XX";

const IP_API_ENDPOINT: &str = "http://ip-api.com/json";

/// Country of a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryInfo {
    /// ISO 3166-1 alpha-2 code, or `XX`
    pub code: String,
    /// Country name in English
    pub name: String,
}

impl CountryInfo {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }

    /// Marker for private, loopback and invalid addresses
    pub fn private() -> Self {
        Self::new(UNKNOWN_COUNTRY_CODE, "Private/Invalid IP")
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_COUNTRY_CODE, "Unknown")
    }

    /// Whether the code names a real country
    pub fn is_known(&self) -> bool {
        self.code.len() == 2
            && self.code.chars().all(|c| c.is_ascii_alphabetic())
            && !self.code.eq_ignore_ascii_case(UNKNOWN_COUNTRY_CODE)
    }
}

impl std::fmt::Display for CountryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.code)
    }
}

/// GeoLocator for looking up IP addresses in MMDB databases
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the country for an IpAddr
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<CountryInfo> {
        let lookup_result = self.reader.lookup(ip)?;
        let city: Option<geoip2::City> = lookup_result.decode()?;

        let Some(city) = city else {
            return Ok(CountryInfo::unknown());
        };

        let code = city
            .country
            .iso_code
            .map(String::from)
            .unwrap_or_else(|| UNKNOWN_COUNTRY_CODE.to_string());
        let name = city
            .country
            .names
            .english
            .map(String::from)
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(CountryInfo { code, name })
    }
}

impl Clone for GeoLocator {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
}

/// Where country lookups are answered from
#[derive(Clone)]
pub enum GeoBackend {
    Disabled,
    Mmdb(GeoLocator),
    IpApi { client: Client, endpoint: String },
}

/// Resolves server hosts to countries
#[derive(Clone)]
pub struct GeoResolver {
    backend: GeoBackend,
}

impl GeoResolver {
    pub fn disabled() -> Self {
        Self {
            backend: GeoBackend::Disabled,
        }
    }

    /// Resolve against a local MaxMind database
    pub fn mmdb<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            backend: GeoBackend::Mmdb(GeoLocator::from_path(path)?),
        })
    }

    /// Resolve through the ip-api.com JSON API
    pub fn ip_api(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            backend: GeoBackend::IpApi {
                client,
                endpoint: IP_API_ENDPOINT.to_string(),
            },
        })
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, GeoBackend::Disabled)
    }

    /// Resolve a host (IP literal or domain) to a country. Never fails.
    pub async fn resolve(&self, host: &str) -> CountryInfo {
        if !self.is_enabled() {
            return CountryInfo::unknown();
        }

        let Some(ip) = resolve_ip(host).await else {
            return CountryInfo::private();
        };
        if !is_public(ip) {
            return CountryInfo::private();
        }

        let result = match &self.backend {
            GeoBackend::Disabled => return CountryInfo::unknown(),
            GeoBackend::Mmdb(locator) => locator.lookup_ip(ip),
            GeoBackend::IpApi { client, endpoint } => lookup_ip_api(client, endpoint, ip).await,
        };

        result.unwrap_or_else(|e| {
            debug!(%ip, error = %e, "geolocation lookup failed");
            CountryInfo::unknown()
        })
    }
}

async fn lookup_ip_api(client: &Client, endpoint: &str, ip: IpAddr) -> Result<CountryInfo> {
    let url = format!("{}/{}?fields=status,country,countryCode", endpoint, ip);
    let response: IpApiResponse = client.get(url).send().await?.json().await?;

    if response.status.as_deref() == Some("fail") {
        return Ok(CountryInfo::unknown());
    }

    Ok(CountryInfo {
        code: response
            .country_code
            .unwrap_or_else(|| UNKNOWN_COUNTRY_CODE.to_string()),
        name: response.country.unwrap_or_else(|| "Unknown".to_string()),
    })
}

async fn resolve_ip(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    let mut addrs = tokio::net::lookup_host((host, 0)).await.ok()?;
    addrs.next().map(|addr| addr.ip())
}

/// Whether an address is globally routable enough to be worth a lookup
pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast())
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}
