//! Gateway-generated RDP connection files.
//!
//! Without `--disable-gateway`, `bastun rdp` asks the gateway for a ready
//! `.rdp` file that routes the Remote Desktop client through the gateway
//! itself, so no local tunnel is opened.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

use bastun_core::{GatewayDescriptor, TargetSpec};

/// File written to the working directory and handed to the client.
pub const RDP_FILE_NAME: &str = "conn.rdp";

/// Lines with this prefix are dropped before the file is written.
const SIGNSCOPE_PREFIX: &str = "signscope";

/// `https://{dns}/api/rdpfile?...` for the target. A DNS name that already
/// carries an `http(s)://` scheme is used as the base verbatim.
pub fn rdpfile_url(gateway: &GatewayDescriptor, target: &TargetSpec, enable_mfa: bool) -> String {
    let dns = gateway.dns_name.trim_end_matches('/');
    let base = if dns.starts_with("https://") || dns.starts_with("http://") {
        dns.to_string()
    } else {
        format!("https://{dns}")
    };
    // The endpoint expects capitalized booleans.
    let mfa = if enable_mfa { "True" } else { "False" };
    format!(
        "{base}/api/rdpfile?resourceId={}&format=rdp&rdpport={}&enablerdsaad={mfa}",
        target.resource_id(),
        target.port()
    )
}

/// Drop the `signscope` lines and normalize line endings to `\n`.
pub fn strip_signscope(body: &str) -> String {
    body.lines()
        .filter(|line| !line.starts_with(SIGNSCOPE_PREFIX))
        .fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
}

/// Download the connection file with the caller's bearer token.
pub async fn fetch(client: &reqwest::Client, url: &str, token: &str) -> Result<String> {
    debug!(url = %url, "requesting rdp file");
    let response = client
        .get(url)
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, "*/*")
        .send()
        .await
        .context("request to the gateway rdpfile endpoint failed")?;

    let status = response.status();
    if !status.is_success() {
        bail!("request to the gateway rdpfile endpoint failed ({status})");
    }
    response
        .text()
        .await
        .context("failed to read the rdp file from the gateway")
}

/// Write the stripped connection file into `dir` and return its path.
pub async fn write(dir: &Path, body: &str) -> Result<PathBuf> {
    let path = dir.join(RDP_FILE_NAME);
    tokio::fs::write(&path, strip_signscope(body))
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
