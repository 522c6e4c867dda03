use std::env;
use std::error;
use std::time::Duration;

use reqwest::Url;

const DEFAULT_HEALTH_URL: &str = "http://127.0.0.1:8000/health";

fn main() -> Result<(), Box<dyn error::Error>> {
    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_HEALTH_URL.to_string());
    let url = Url::parse(&url)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client.get(url.clone()).send()?;
    if !response.status().is_success() {
        return Err(format!("{} answered with {}", url, response.status()).into());
    }

    Ok(())
}
