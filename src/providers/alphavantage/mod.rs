//! Alpha Vantage market data adapter
//!
//! Uses the `GLOBAL_QUOTE` and `REALTIME_OPTIONS` query functions. Alpha
//! Vantage answers throttled requests with HTTP 200 and a `Note` or
//! `Information` field instead of data, so every body is checked before it
//! is decoded.

use crate::error::{AppError, Result};
use crate::providers::types::*;
use crate::providers::{MarketDataProvider, ProviderError};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co";

/// Alpha Vantage provider implementation
pub struct AlphaVantageProvider {
    client: Client,
    query_url: Url,
    api_key: String,
}

impl AlphaVantageProvider {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("Invalid provider base URL '{}': {}", base_url, e)))?;
        let query_url = base
            .join("query")
            .map_err(|e| AppError::Config(format!("Invalid provider base URL '{}': {}", base_url, e)))?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            query_url,
            api_key: api_key.to_string(),
        })
    }

    async fn query(
        &self,
        function: &str,
        symbol: &str,
        extra: &[(&str, &str)],
    ) -> std::result::Result<Value, ProviderError> {
        let mut params = vec![
            ("function", function),
            ("symbol", symbol),
            ("apikey", self.api_key.as_str()),
        ];
        params.extend_from_slice(extra);

        let response = self
            .client
            .get(self.query_url.clone())
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited(format!(
                "{} {} returned HTTP 429",
                function, symbol
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "{} {} returned HTTP {}",
                function, symbol, status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        if let Some(err) = classify_body(&body) {
            return Err(err);
        }

        Ok(body)
    }
}

#[async_trait]
impl MarketDataProvider for AlphaVantageProvider {
    fn id(&self) -> &'static str {
        "alphavantage"
    }

    async fn fetch_quote(&self, symbol: &str) -> std::result::Result<Quote, ProviderError> {
        let body = self.query("GLOBAL_QUOTE", symbol, &[]).await?;
        parse_global_quote(symbol, body)
    }

    async fn fetch_options_chain(
        &self,
        symbol: &str,
    ) -> std::result::Result<Vec<OptionContract>, ProviderError> {
        let body = self
            .query("REALTIME_OPTIONS", symbol, &[("require_greeks", "true")])
            .await?;
        parse_options_chain(symbol, body)
    }
}

/// Detect throttling and error notices delivered with a 200 status
fn classify_body(body: &Value) -> Option<ProviderError> {
    if let Some(note) = body.get("Note").and_then(Value::as_str) {
        return Some(ProviderError::RateLimited(note.to_string()));
    }

    if let Some(info) = body.get("Information").and_then(Value::as_str) {
        let lower = info.to_ascii_lowercase();
        if lower.contains("rate limit")
            || lower.contains("call frequency")
            || lower.contains("requests per")
        {
            return Some(ProviderError::RateLimited(info.to_string()));
        }
        return Some(ProviderError::Unavailable(info.to_string()));
    }

    body.get("Error Message")
        .and_then(Value::as_str)
        .map(|msg| ProviderError::Unavailable(msg.to_string()))
}

#[derive(Deserialize)]
struct RawQuote {
    #[serde(rename = "01. symbol")]
    symbol: String,
    #[serde(rename = "02. open", deserialize_with = "deserialize_flexible_f64")]
    open: f64,
    #[serde(rename = "03. high", deserialize_with = "deserialize_flexible_f64")]
    high: f64,
    #[serde(rename = "04. low", deserialize_with = "deserialize_flexible_f64")]
    low: f64,
    #[serde(rename = "05. price", deserialize_with = "deserialize_flexible_f64")]
    price: f64,
    #[serde(rename = "06. volume", deserialize_with = "deserialize_flexible_i64")]
    volume: i64,
    #[serde(rename = "07. latest trading day")]
    latest_trading_day: String,
    #[serde(rename = "08. previous close", deserialize_with = "deserialize_flexible_f64")]
    previous_close: f64,
    #[serde(rename = "09. change", deserialize_with = "deserialize_flexible_f64")]
    change: f64,
    #[serde(rename = "10. change percent", deserialize_with = "deserialize_percent")]
    change_percent: f64,
}

fn parse_global_quote(symbol: &str, body: Value) -> std::result::Result<Quote, ProviderError> {
    let raw = match body.get("Global Quote") {
        Some(Value::Object(map)) if !map.is_empty() => Value::Object(map.clone()),
        _ => {
            return Err(ProviderError::Unavailable(format!(
                "no quote returned for {}",
                symbol
            )))
        }
    };

    let raw: RawQuote =
        serde_json::from_value(raw).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    Ok(Quote {
        symbol: raw.symbol.to_ascii_uppercase(),
        price: raw.price,
        open: raw.open,
        high: raw.high,
        low: raw.low,
        previous_close: raw.previous_close,
        change: raw.change,
        change_percent: raw.change_percent,
        volume: raw.volume,
        latest_trading_day: raw.latest_trading_day,
    })
}

#[derive(Deserialize)]
struct OptionsResponse {
    #[serde(default)]
    data: Vec<RawContract>,
}

#[derive(Deserialize)]
struct RawContract {
    #[serde(rename = "contractID")]
    contract_id: String,
    symbol: String,
    expiration: String,
    #[serde(deserialize_with = "deserialize_flexible_f64")]
    strike: f64,
    #[serde(rename = "type")]
    option_type: String,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    last: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    bid: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    ask: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    volume: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    open_interest: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    implied_volatility: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    delta: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    gamma: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    theta: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    vega: Option<f64>,
}

fn parse_options_chain(
    symbol: &str,
    body: Value,
) -> std::result::Result<Vec<OptionContract>, ProviderError> {
    let response: OptionsResponse =
        serde_json::from_value(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let total = response.data.len();
    let contracts: Vec<OptionContract> = response
        .data
        .into_iter()
        .filter_map(|raw| {
            let expiration = NaiveDate::parse_from_str(&raw.expiration, "%Y-%m-%d").ok()?;
            let option_type = raw.option_type.parse::<OptionType>().ok()?;
            Some(OptionContract {
                contract_id: raw.contract_id,
                symbol: raw.symbol.to_ascii_uppercase(),
                expiration,
                strike: raw.strike,
                option_type,
                bid: raw.bid.unwrap_or(0.0),
                ask: raw.ask.unwrap_or(0.0),
                last: raw.last.unwrap_or(0.0),
                volume: raw.volume.unwrap_or(0.0) as i64,
                open_interest: raw.open_interest.unwrap_or(0.0) as i64,
                implied_volatility: raw.implied_volatility,
                delta: raw.delta,
                gamma: raw.gamma,
                theta: raw.theta,
                vega: raw.vega,
            })
        })
        .collect();

    if contracts.len() < total {
        tracing::warn!(
            "AlphaVantage::fetch_options_chain - {} dropped {} malformed contracts",
            symbol,
            total - contracts.len()
        );
    }

    Ok(contracts)
}

// ============================================================================
// Flexible deserializers (Alpha Vantage sends numbers as strings)
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum FlexibleNumber {
    Float(f64),
    Int(i64),
    Str(String),
}

fn deserialize_flexible_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match FlexibleNumber::deserialize(deserializer)? {
        FlexibleNumber::Float(f) => Ok(f),
        FlexibleNumber::Int(i) => Ok(i as f64),
        FlexibleNumber::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn deserialize_flexible_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match FlexibleNumber::deserialize(deserializer)? {
        FlexibleNumber::Float(f) => Ok(f as i64),
        FlexibleNumber::Int(i) => Ok(i),
        FlexibleNumber::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// "0.5141%" -> 0.5141
fn deserialize_percent<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match FlexibleNumber::deserialize(deserializer)? {
        FlexibleNumber::Float(f) => Ok(f),
        FlexibleNumber::Int(i) => Ok(i as f64),
        FlexibleNumber::Str(s) => s
            .trim()
            .trim_end_matches('%')
            .parse()
            .map_err(serde::de::Error::custom),
    }
}

fn deserialize_optional_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<FlexibleNumber>::deserialize(deserializer)? {
        None => Ok(None),
        Some(FlexibleNumber::Float(f)) => Ok(Some(f)),
        Some(FlexibleNumber::Int(i)) => Ok(Some(i as f64)),
        Some(FlexibleNumber::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(FlexibleNumber::Str(s)) => Ok(s.trim().parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    const GLOBAL_QUOTE_BODY: &str = r#"{
        "Global Quote": {
            "01. symbol": "IBM",
            "02. open": "189.5000",
            "03. high": "191.2000",
            "04. low": "188.9000",
            "05. price": "190.4000",
            "06. volume": "3812345",
            "07. latest trading day": "2024-03-01",
            "08. previous close": "189.4300",
            "09. change": "0.9700",
            "10. change percent": "0.5121%"
        }
    }"#;

    fn provider(server: &mockito::Server) -> AlphaVantageProvider {
        AlphaVantageProvider::new(&server.url(), "demo", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_quote_parses_string_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/query")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("function".into(), "GLOBAL_QUOTE".into()),
                Matcher::UrlEncoded("symbol".into(), "IBM".into()),
                Matcher::UrlEncoded("apikey".into(), "demo".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(GLOBAL_QUOTE_BODY)
            .create_async()
            .await;

        let quote = provider(&server).fetch_quote("IBM").await.unwrap();
        mock.assert_async().await;

        assert_eq!(quote.symbol, "IBM");
        assert_eq!(quote.price, 190.4);
        assert_eq!(quote.volume, 3_812_345);
        assert!((quote.change_percent - 0.5121).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_note_body_is_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({"Note": "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."})
                    .to_string(),
            )
            .create_async()
            .await;

        let err = provider(&server).fetch_quote("IBM").await.unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn test_http_429_is_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/query")
            .match_query(Matcher::Any)
            .with_status(429)
            .create_async()
            .await;

        let err = provider(&server).fetch_options_chain("IBM").await.unwrap_err();
        assert_eq!(err.kind().code(), "RATE_LIMIT");
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/query")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let err = provider(&server).fetch_quote("IBM").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_fetch_options_chain() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "endpoint": "Realtime Options",
            "message": "success",
            "data": [
                {
                    "contractID": "IBM240315P00185000",
                    "symbol": "IBM",
                    "expiration": "2024-03-15",
                    "strike": "185.00",
                    "type": "put",
                    "last": "1.10",
                    "mark": "1.12",
                    "bid": "1.08",
                    "ask": "1.16",
                    "volume": "412",
                    "open_interest": "2310",
                    "implied_volatility": "0.2213",
                    "delta": "-0.2810",
                    "gamma": "0.0301",
                    "theta": "-0.0912",
                    "vega": "0.1104"
                },
                {
                    "contractID": "IBM-BROKEN",
                    "symbol": "IBM",
                    "expiration": "not-a-date",
                    "strike": "190.00",
                    "type": "call"
                }
            ]
        });
        server
            .mock("GET", "/query")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("function".into(), "REALTIME_OPTIONS".into()),
                Matcher::UrlEncoded("require_greeks".into(), "true".into()),
            ]))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let chain = provider(&server).fetch_options_chain("IBM").await.unwrap();
        assert_eq!(chain.len(), 1);
        let put = &chain[0];
        assert_eq!(put.option_type, OptionType::Put);
        assert_eq!(put.strike, 185.0);
        assert_eq!(put.open_interest, 2310);
        assert_eq!(put.delta, Some(-0.281));
        assert_eq!(put.expiration, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }

    #[test]
    fn test_classify_body() {
        assert!(classify_body(&json!({"Global Quote": {}})).is_none());
        assert!(matches!(
            classify_body(&json!({"Information": "We have detected your API key and our standard API rate limit is 25 requests per day."})),
            Some(ProviderError::RateLimited(_))
        ));
        assert!(matches!(
            classify_body(&json!({"Information": "This is a premium endpoint."})),
            Some(ProviderError::Unavailable(_))
        ));
        assert!(matches!(
            classify_body(&json!({"Error Message": "Invalid API call."})),
            Some(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn test_empty_global_quote_is_unavailable() {
        let err = parse_global_quote("ZZZZ", json!({"Global Quote": {}})).unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let result = AlphaVantageProvider::new("not a url", "demo", Duration::from_secs(1));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
