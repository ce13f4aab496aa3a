use std::collections::HashMap;

use flagcore::{AttributeValue, ClientConfig, EvaluationContext, LoadOutcome};

pub fn main() {
    env_logger::init();

    let api_key = std::env::var("FLAGCORE_API_KEY").unwrap();
    let mut config = ClientConfig::from_api_key(api_key);
    if let Ok(personal_api_key) = std::env::var("FLAGCORE_PERSONAL_API_KEY") {
        config = config.personal_api_key(personal_api_key);
    }
    let client = config.to_client().unwrap();

    // Load definitions up front so the first lookups can be evaluated locally.
    if let LoadOutcome::Failed(err) = client.load_feature_flag_definitions() {
        println!("Definitions not loaded, flags will be requested remotely: {err}");
    }

    let context = EvaluationContext::new("test-subject").with_person_properties(HashMap::from([(
        "email".to_owned(),
        AttributeValue::from("test@example.com"),
    )]));

    let enabled = client.is_feature_enabled("a-boolean-flag", false, &context);
    println!("Enabled: {:?}", enabled);

    if let Some(err) = client.get_feature_flag_error("a-boolean-flag", &context.distinct_id) {
        println!("Flag error: {err}");
    }

    client.shut_down();
}
