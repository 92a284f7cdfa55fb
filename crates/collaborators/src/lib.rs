//! External collaborators: the customer-support CRM (§6.1), payment
//! providers (§6.2), and the Outbound Gateway (C15) built on top of them.

pub mod crm;
pub mod outbound;
pub mod payments;

pub use crm::{Conversation, CrmClient, CrmConfig, CrmError, CrmMessage, MessageType};
pub use outbound::{Channel, GatewayConfig, GatewayError, LoggingChannel, OutboundGateway, SendOutcome};
pub use payments::{
    OrderRequest, PaymentError, PaymentHandle, PaymentProvider, PaymentStatus, PaymentStatusReport, RestPaymentProvider,
    WebhookEvent,
};
