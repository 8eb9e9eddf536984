//! Vendored protobuf bindings for the Salesforce Pub/Sub API
//! (`eventbus.v1`), covering the subset of the service the CDC listener
//! drives: `Subscribe`, `GetTopic`, and `GetSchema`.

pub mod eventbus {
    pub mod v1 {
        include!("eventbus.v1.rs");
    }
}
