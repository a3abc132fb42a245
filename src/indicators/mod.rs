// =============================================================================
// Technical indicators — pure functions over ordered candle series
// =============================================================================
//
// Every function in this module is total: empty or short inputs produce a
// safe neutral default, never a panic. The decision engine relies on that.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod composite;
pub mod macd;
pub mod rsi;
pub mod volume;

pub use atr::atr;
pub use bollinger::{bollinger, BollingerBands};
pub use composite::{composite, BiasTag, IndicatorBundle};
pub use macd::{macd, MacdResult};
pub use rsi::rsi;
pub use volume::volume_ratio;
