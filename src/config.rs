use once_cell::sync::Lazy;
use std::fs;
use url::Url;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: billing-config -> subscription sweep cadence
pub static BILLING_SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// key: billing-config -> grace window before a past_due subscription is cancelled
pub static BILLING_PAST_DUE_GRACE_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_PAST_DUE_GRACE_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(7)
});

/// key: billing-config -> webhook reconciler worker pool size
pub static WEBHOOK_WORKER_COUNT: Lazy<usize> = Lazy::new(|| {
    std::env::var("WEBHOOK_WORKER_COUNT")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(4)
});

/// key: billing-config -> attempts before a failing webhook event is parked
pub static WEBHOOK_MAX_ATTEMPTS: Lazy<i32> = Lazy::new(|| {
    std::env::var("WEBHOOK_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

/// key: billing-config -> outbound gateway call timeout
pub static GATEWAY_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("GATEWAY_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

/// Redirect target after a completed checkout or payment. Must be an absolute URL.
pub static CHECKOUT_RETURN_URL: Lazy<String> = Lazy::new(|| {
    let raw = std::env::var("CHECKOUT_RETURN_URL")
        .unwrap_or_else(|_| "http://localhost:3000/billing/return".to_string());
    Url::parse(&raw).unwrap_or_else(|err| panic!("CHECKOUT_RETURN_URL is not a valid URL: {err}"));
    raw
});

/// Stripe API credentials. The gateway is registered only when the secret key is present.
pub static STRIPE_SECRET_KEY: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("STRIPE_SECRET_KEY", "STRIPE_SECRET_KEY_FILE"));

/// Stripe webhook signing secret (`whsec_...`).
pub static STRIPE_WEBHOOK_SECRET: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("STRIPE_WEBHOOK_SECRET", "STRIPE_WEBHOOK_SECRET_FILE"));

/// Override for the Stripe API base URL. Used by tests to point at a mock server.
pub static STRIPE_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("STRIPE_API_BASE").unwrap_or_else(|| "https://api.stripe.com".to_string())
});

/// PayU point-of-sale id. The gateway is registered only when both PayU values are present.
pub static PAYU_POS_ID: Lazy<Option<String>> = Lazy::new(|| read_optional_env("PAYU_POS_ID"));

/// PayU second key, used to sign and verify notification payloads.
pub static PAYU_SECOND_KEY: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("PAYU_SECOND_KEY", "PAYU_SECOND_KEY_FILE"));

/// Override for the PayU API base URL. Used by tests to point at a mock server.
pub static PAYU_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("PAYU_API_BASE").unwrap_or_else(|| "https://secure.payu.com".to_string())
});

/// Optional endpoint notified (fire-and-forget) after a booking payment is confirmed.
pub static NOTIFY_WEBHOOK_URL: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("NOTIFY_WEBHOOK_URL"));

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_secret_env(value_key: &str, file_key: &str) -> Option<String> {
    if let Some(path) = read_optional_env(file_key) {
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
            Err(err) => panic!("failed to read {file_key} from {path}: {err}"),
        }
    }

    read_optional_env(value_key)
}
