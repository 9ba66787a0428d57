pub mod auto_redeem;
pub mod price_refresh;
pub mod stop_loss;
