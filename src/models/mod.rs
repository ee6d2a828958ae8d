pub mod ad;
pub mod campaign;
pub mod context;
pub mod money;
pub mod placement;
pub mod segment;
pub mod statistic;

pub use ab_test::{AbTestStatus, AdAbTest, NewAbTest, WinnerMetric};
pub use ad::{AbVariant, Ad, AdFormat, AdStatus, Creative, NewAd};
pub use campaign::{AdCampaign, CampaignStatus, NewCampaign};
pub use context::RequestContext;
pub use money::Money;
pub use placement::{AdPlacement, NewPlacement};
pub use segment::{AdSegment, NewSegment};
pub use statistic::{
    AdStatistic, BreakdownDimension, BreakdownEntry, StatisticsSummary,
};
