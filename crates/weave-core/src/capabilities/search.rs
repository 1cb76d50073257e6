//! Search capabilities: web, flights, hotels.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capability::{Capability, CapabilityError, PreparedInputs, RunContext, RunValue};

fn str_or<'a>(prepared: &'a PreparedInputs, key: &str, fallback: &'a str) -> &'a str {
    prepared.get(key).and_then(Value::as_str).unwrap_or(fallback)
}

/// General web search. Returns a small result list derived from the query.
pub struct WebSearch;

#[async_trait]
impl Capability for WebSearch {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let query = prepared.require_str("query")?;
        let results = json!([
            {
                "title": format!("Overview: {query}"),
                "snippet": format!("Key facts and current information about {query}."),
                "url": format!("https://search.example/{}", query.replace(' ', "+")),
            },
            {
                "title": format!("{query} — detailed guide"),
                "snippet": format!("In-depth coverage of {query} with recent updates."),
                "url": format!("https://guides.example/{}", query.replace(' ', "+")),
            },
        ]);
        Ok(RunValue::data([("search_results", results)]))
    }

    fn summarize(&self, value: &RunValue) -> Option<String> {
        match value {
            RunValue::Data(outputs) => outputs
                .get("search_results")
                .and_then(Value::as_array)
                .map(|r| format!("{} search results", r.len())),
            RunValue::AwaitUser { .. } => None,
        }
    }
}

/// Flight search between two airports.
pub struct FlightSearch;

#[async_trait]
impl Capability for FlightSearch {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let origin = str_or(prepared, "origin", "LAX");
        let destination = str_or(prepared, "destination", "PVG");
        let date = str_or(prepared, "date", "2025-07-01");

        let options = json!([
            {
                "airline": "United Airlines",
                "flight_number": "UA857",
                "departure": "14:30",
                "arrival": "18:45",
                "duration_minutes": 735,
                "price": 850,
                "origin": origin,
                "destination": destination,
                "date": date,
            },
            {
                "airline": "China Eastern",
                "flight_number": "MU586",
                "departure": "15:45",
                "arrival": "19:30",
                "duration_minutes": 705,
                "price": 720,
                "origin": origin,
                "destination": destination,
                "date": date,
            },
            {
                "airline": "Delta Airlines",
                "flight_number": "DL287",
                "departure": "16:20",
                "arrival": "20:15",
                "duration_minutes": 715,
                "price": 920,
                "origin": origin,
                "destination": destination,
                "date": date,
            },
        ]);
        Ok(RunValue::data([("flight_options", options)]))
    }

    fn summarize(&self, value: &RunValue) -> Option<String> {
        match value {
            RunValue::Data(outputs) => outputs
                .get("flight_options")
                .and_then(Value::as_array)
                .map(|o| format!("{} flight options found", o.len())),
            RunValue::AwaitUser { .. } => None,
        }
    }
}

/// Hotel search for a location and date range.
pub struct HotelSearch;

#[async_trait]
impl Capability for HotelSearch {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let location = prepared.require_str("location")?;
        let check_in = str_or(prepared, "check_in", "2025-07-01");
        let check_out = str_or(prepared, "check_out", "2025-07-05");

        let options = json!([
            {
                "name": format!("{location} Central Hotel"),
                "rating": 4.4,
                "price_per_night": 140,
                "check_in": check_in,
                "check_out": check_out,
            },
            {
                "name": format!("{location} Riverside Inn"),
                "rating": 4.1,
                "price_per_night": 95,
                "check_in": check_in,
                "check_out": check_out,
            },
        ]);
        Ok(RunValue::data([("hotel_options", options)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_web_search_requires_query() {
        let err = WebSearch
            .run(&PreparedInputs::new(), &RunContext::for_tests())
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_flight_search_defaults() {
        let value = FlightSearch
            .run(&PreparedInputs::new(), &RunContext::for_tests())
            .await
            .unwrap();
        let RunValue::Data(outputs) = value else {
            panic!("expected data")
        };
        let options = outputs["flight_options"].as_array().unwrap();
        assert_eq!(options.len(), 3);
        assert_eq!(options[0]["origin"], "LAX");
    }

    #[tokio::test]
    async fn test_flight_search_is_idempotent() {
        let mut prepared = PreparedInputs::new();
        prepared.insert("origin", serde_json::json!("SFO"));
        let ctx = RunContext::for_tests();
        let a = FlightSearch.run(&prepared, &ctx).await.unwrap();
        let b = FlightSearch.run(&prepared, &ctx).await.unwrap();
        match (a, b) {
            (RunValue::Data(a), RunValue::Data(b)) => assert_eq!(a["flight_options"], b["flight_options"]),
            _ => panic!("expected data"),
        }
    }
}
