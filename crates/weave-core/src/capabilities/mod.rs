//! Built-in capabilities and the default node catalog.
//!
//! These are deterministic stand-ins honouring the declared I/O contracts;
//! a deployment swaps in real integrations by rebinding the `invoke` ids.

mod analysis;
mod booking;
mod interaction;
mod search;
mod transform;

pub use analysis::{CostAnalysis, PreferenceMatcher, ResultSummarizer};
pub use booking::{FlightBooking, PaymentProcessing};
pub use interaction::UserQuery;
pub use search::{FlightSearch, HotelSearch, WebSearch};
pub use transform::DataFormatter;

use std::sync::Arc;

use crate::capability::CapabilityBindings;
use crate::registry::{
    NodeCategory, NodeDescriptor, NodeRegistry, PermissionTier, RegistryError,
};

/// Bindings for every built-in capability, keyed by `invoke` id.
pub fn builtin_bindings() -> CapabilityBindings {
    let mut bindings = CapabilityBindings::new();
    bindings.bind("web_search", Arc::new(WebSearch));
    bindings.bind("flight_search", Arc::new(FlightSearch));
    bindings.bind("hotel_search", Arc::new(HotelSearch));
    bindings.bind("cost_analysis", Arc::new(CostAnalysis));
    bindings.bind("preference_matcher", Arc::new(PreferenceMatcher));
    bindings.bind("result_summarizer", Arc::new(ResultSummarizer));
    bindings.bind("user_query", Arc::new(UserQuery));
    bindings.bind("flight_booking", Arc::new(FlightBooking));
    bindings.bind("payment_processing", Arc::new(PaymentProcessing));
    bindings.bind("data_formatter", Arc::new(DataFormatter));
    bindings
}

fn descriptor(
    name: &str,
    description: &str,
    category: NodeCategory,
    tier: PermissionTier,
    inputs: &[&str],
    outputs: &[&str],
) -> NodeDescriptor {
    NodeDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        category,
        permission_tier: tier,
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        examples: vec![],
        estimated_cost: None,
        estimated_time_seconds: None,
        invoke: name.to_string(),
    }
}

/// The default catalog, used when no registry configuration document is
/// supplied.
pub fn default_catalog() -> Vec<NodeDescriptor> {
    vec![
        descriptor(
            "web_search",
            "Search the web for current information",
            NodeCategory::Search,
            PermissionTier::None,
            &["query"],
            &["search_results"],
        ),
        descriptor(
            "flight_search",
            "Search for flight options between two airports",
            NodeCategory::Search,
            PermissionTier::None,
            &["origin", "destination", "date"],
            &["flight_options"],
        ),
        descriptor(
            "hotel_search",
            "Search for hotel options and prices",
            NodeCategory::Search,
            PermissionTier::Basic,
            &["location", "check_in", "check_out", "preferences"],
            &["hotel_options"],
        ),
        descriptor(
            "cost_analysis",
            "Analyze priced options and recommend the cheapest and best value",
            NodeCategory::Analysis,
            PermissionTier::None,
            &["flight_options"],
            &["cost_analysis"],
        ),
        descriptor(
            "preference_matcher",
            "Pick the option that best matches the user's stated preferences",
            NodeCategory::Analysis,
            PermissionTier::None,
            &["flight_options", "preferences"],
            &["matched_option"],
        ),
        descriptor(
            "result_summarizer",
            "Summarize results and provide recommendations",
            NodeCategory::Analysis,
            PermissionTier::None,
            &["results", "user_question"],
            &["summary"],
        ),
        descriptor(
            "user_query",
            "Ask the user for additional information or clarification",
            NodeCategory::Communication,
            PermissionTier::None,
            &["question"],
            &["user_response"],
        ),
        descriptor(
            "flight_booking",
            "Book a selected flight",
            NodeCategory::Booking,
            PermissionTier::Sensitive,
            &["selected_flight"],
            &["booking_confirmation"],
        ),
        descriptor(
            "payment_processing",
            "Process payment for a booking",
            NodeCategory::Payment,
            PermissionTier::Critical,
            &["amount", "payment_method", "description"],
            &["payment_confirmation"],
        ),
        descriptor(
            "data_formatter",
            "Format data for better presentation",
            NodeCategory::Transformation,
            PermissionTier::None,
            &["raw_data", "format_type"],
            &["formatted_data"],
        ),
    ]
}

/// Registry pre-populated with the built-in catalog.
pub fn builtin_registry(bindings: &CapabilityBindings) -> Result<NodeRegistry, RegistryError> {
    let mut registry = NodeRegistry::new();
    for descriptor in default_catalog() {
        registry.register(descriptor, bindings)?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_catalog_entry_binds() {
        let bindings = builtin_bindings();
        let registry = builtin_registry(&bindings).unwrap();
        assert_eq!(registry.len(), default_catalog().len());
    }

    #[test]
    fn test_catalog_tiers() {
        let bindings = builtin_bindings();
        let registry = builtin_registry(&bindings).unwrap();
        assert_eq!(
            registry.get("payment_processing").unwrap().descriptor.permission_tier,
            PermissionTier::Critical
        );
        assert_eq!(
            registry.get("flight_booking").unwrap().descriptor.permission_tier,
            PermissionTier::Sensitive
        );
        assert_eq!(
            registry.get("web_search").unwrap().descriptor.permission_tier,
            PermissionTier::None
        );
    }
}
