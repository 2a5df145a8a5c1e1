pub(crate) mod data {
    pub(crate) mod datasources {
        pub(crate) mod app_store_auth;
        pub(crate) mod app_store_connect_api_datasource;
        pub(crate) mod app_store_receipt_datasource;
        pub(crate) mod app_store_server_api_datasource;
        pub(crate) mod firebase_messaging_datasource;
        pub(crate) mod google_auth;
        pub(crate) mod google_play_developer_api_datasource;
        pub(crate) mod stripe_api_datasource;
        pub(crate) mod utils;
    }
    pub(crate) mod models {
        pub(crate) mod app_store_connect_api {
            pub(crate) mod connect_response_model;
        }
        pub(crate) mod app_store_receipt_api {
            pub(crate) mod verify_receipt_response_model;
        }
        pub(crate) mod app_store_server_api {
            pub(crate) mod common;
            pub(crate) mod jws_renewal_info_decoded_payload_model;
            pub(crate) mod jws_transaction_decoded_payload_model;
            pub(crate) mod status_response_model;
        }
        pub(crate) mod firebase_messaging_api {
            pub(crate) mod send_message_request_model;
        }
        pub(crate) mod google_play_developer_api {
            pub(crate) mod subscription_model;
            pub(crate) mod subscription_purchase_v2_model;
        }
        pub(crate) mod stripe_api {
            pub(crate) mod payment_intent_model;
        }
    }
    pub(crate) mod repositories {
        pub(crate) mod in_memory_ledger_store;
        pub(crate) mod storefront_repository_impl;
    }
}

pub mod domain {
    pub mod entities {
        pub mod generation;
        pub mod notification;
        pub mod payment_record;
        pub mod plan;
        pub mod storefront_status;
        pub mod user_account;
        pub mod user_subscription;
        pub mod verification;
    }
    pub mod repositories {
        pub mod ledger_store;
        pub mod notification_repository;
        pub mod storefront_repository;
    }
    pub mod services {
        pub mod credit_ledger;
        pub mod notifier;
        pub mod payment_ledger;
        pub mod plan_catalog;
        pub mod purchase_verifier;
        pub mod reconciler;
        pub mod subscription_state_machine;
    }
}

pub mod clock;
pub mod config;
pub mod constants;
pub mod errors;
pub mod secrets;
pub mod util;

pub use data::repositories::in_memory_ledger_store::InMemoryLedgerStore;
