use chrono::Duration;

pub(crate) const GOOGLE_PLAY_API_BASE_URL: &str =
    "https://androidpublisher.googleapis.com/androidpublisher/v3";
pub(crate) const GOOGLE_PLAY_SCOPE: &str = "https://www.googleapis.com/auth/androidpublisher";

pub(crate) const APP_STORE_SERVER_API_PRODUCTION_URL: &str = "https://api.storekit.itunes.apple.com";
pub(crate) const APP_STORE_SERVER_API_SANDBOX_URL: &str =
    "https://api.storekit-sandbox.itunes.apple.com";
pub(crate) const APP_STORE_CONNECT_API_URL: &str = "https://api.appstoreconnect.apple.com";
pub(crate) const APP_STORE_RECEIPT_PRODUCTION_URL: &str =
    "https://buy.itunes.apple.com/verifyReceipt";
pub(crate) const APP_STORE_RECEIPT_SANDBOX_URL: &str =
    "https://sandbox.itunes.apple.com/verifyReceipt";
pub(crate) const APP_STORE_JWT_AUDIENCE: &str = "appstoreconnect-v1";

pub(crate) const FIREBASE_MESSAGING_API_URL: &str = "https://fcm.googleapis.com/v1";
pub(crate) const FIREBASE_MESSAGING_SCOPE: &str =
    "https://www.googleapis.com/auth/firebase.messaging";

/// Territory whose price is used when syncing App Store plans.
pub(crate) const APP_STORE_PRICE_TERRITORY: &str = "USA";
/// Region whose price is used when syncing Google Play plans.
pub(crate) const GOOGLE_PLAY_PRICE_REGION: &str = "US";

/// Credits every Free-plan user holds after a reset.
pub const FREE_TOTAL_CREDITS: i64 = 4;
pub const FREE_DAILY_CREDITS: i64 = 4;
pub const FREE_IMAGE_CREDITS: i64 = 0;
pub const FREE_PROMPT_CREDITS: i64 = 4;

/// Service continues this long past `end_date` for a cancelled subscription.
pub fn grace_period() -> Duration {
    Duration::days(7)
}

/// A renewed storefront subscription only refreshes credits if the previous
/// grant is at least this old.
pub fn credit_refresh_interval() -> Duration {
    Duration::hours(24)
}

/// Not-found storefront lookups only count as expired once the local record
/// is past its expiry by this much...
pub fn not_found_expiry_threshold() -> Duration {
    Duration::days(30)
}

/// ...or, when no expiry is known locally, once the record is this old.
pub fn not_found_age_threshold() -> Duration {
    Duration::days(60)
}

/// Auto-renewing subscriptions ending within this window get a reminder.
pub fn renewal_reminder_window() -> Duration {
    Duration::days(3)
}

pub const AD_REWARD_CREDITS: i64 = 2;
pub const AD_REWARDS_PER_DAY: u32 = 2;
pub const LEGACY_BONUS_CREDITS: i64 = 10;

/// Minimum length of an App Store transaction id worth querying.
pub(crate) const APPLE_TRANSACTION_ID_MIN_LEN: usize = 10;
