/// The parts of a Stripe PaymentIntent the ledger reads.
///
/// https://docs.stripe.com/api/payment_intents/object
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PaymentIntentModel {
    /// Unique identifier for the object.
    pub(crate) id: String,
    /// Amount intended to be collected, in the smallest currency unit.
    pub(crate) amount: i64,
    /// Whether the PaymentIntent reached `succeeded`.
    pub(crate) succeeded: bool,
    /// Status of this PaymentIntent, as reported by Stripe (e.g.
    /// `requires_payment_method`, `processing`, `succeeded`).
    pub(crate) status: String,
    /// The client secret of this PaymentIntent. Only returned on creation.
    pub(crate) client_secret: Option<String>,
    /// Set of key-value pairs attached to the object.
    pub(crate) metadata: std::collections::BTreeMap<String, String>,
}
