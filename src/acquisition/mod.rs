// =============================================================================
// Acquisition Pipeline — watchlist -> research -> conditional -> verification
// =============================================================================
//
// Flow:
//   acquisition_watchlist (pending)
//       |  researcher: gather fundamentals + filings + internal signals
//   stock_research_library (library_ready | partial)
//       |  analyst: reasoning-tier plan, promote above the confidence bar
//   conditional_tracking (active)
//       |  verifier: daily fast-tier confirm / flag / invalidate
//       |  broker: entry when live price touches the target
//   trade_records
// =============================================================================

pub mod analyst;
pub mod hound;
pub mod researcher;
pub mod verifier;

pub use analyst::Analyst;
pub use hound::Hound;
pub use researcher::Researcher;
pub use verifier::Verifier;
