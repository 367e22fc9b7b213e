use flagwise::{ClientConfig, EvaluationContext, ImpressionEvent, ToggleBootstrapFileProvider};

pub fn main() {
    env_logger::init();

    let base_url = std::env::var("FLAGWISE_BASE_URL").unwrap();
    let token = std::env::var("FLAGWISE_CLIENT_TOKEN").unwrap();

    let mut config = ClientConfig::new("simple-demo")
        .base_url(base_url)
        .custom_header("authorization", token)
        .impression_handler(|event: ImpressionEvent| {
            println!("Impression: {}", serde_json::to_string(&event).unwrap());
        });
    // Optional offline fallback, used until the first fetch completes.
    if let Ok(path) = std::env::var("FLAGWISE_BOOTSTRAP_FILE") {
        config = config.bootstrap_provider(ToggleBootstrapFileProvider::new(path));
    }
    let client = config.to_client().unwrap();

    // Start a poller thread to fetch toggles from the server.
    let poller = client.start_poller_thread().unwrap();

    // Block waiting for the first fetch. Until this call returns, the client answers from cache or
    // bootstrap.
    poller.wait_for_configuration().unwrap();

    let context = EvaluationContext::new().with_user_id("test-user");
    println!("Toggles: {:?}", client.toggle_names());
    println!(
        "new-search enabled: {}",
        client.is_enabled_with_context("new-search", &context)
    );
    println!(
        "checkout-button variant: {:?}",
        client.get_variant_with_context("checkout-button", &context)
    );

    poller.shutdown().unwrap();
}
