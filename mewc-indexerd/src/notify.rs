//! Concrete `NotificationSink`: logs the size of each touched set at
//! `info` level once per caught-up commit. The wire protocol that would
//! push these to subscribed light clients is out of scope; this is the
//! minimal real collaborator that satisfies the trait without a hidden
//! no-op stand-in.

use async_trait::async_trait;
use mewc_index_core::cache::TouchedSets;
use mewc_index_core::store::NotificationSink;

pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(&self, touched: &TouchedSets) {
        tracing::info!(
            hash_x = touched.hash_x.len(),
            asset_name = touched.asset_name.len(),
            qualifier = touched.qualifier.len(),
            h160 = touched.h160.len(),
            broadcast_asset = touched.broadcast_asset.len(),
            frozen_asset = touched.frozen_asset.len(),
            validator_asset = touched.validator_asset.len(),
            qualifier_association = touched.qualifier_association.len(),
            "touched sets ready for notification"
        );
    }
}
