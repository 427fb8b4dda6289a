pub mod member;
pub mod order;
pub mod otp;
pub mod pricing;
pub mod terminal;
pub mod token;
pub mod user;
