pub mod payu;
pub mod stripe;
