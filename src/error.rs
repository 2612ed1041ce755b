//! Error types for micropay-gateway.
//!
//! Errors fall into the classes of [`ErrorClass`]. Business-expected classes
//! (authentication, authorization, credit) are returned to the API layer as
//! typed results. Infrastructure errors fail closed. Invariant violations are
//! fatal for the affected client.

use crate::oracle::OracleError;
use crate::tracker::TrackerError;
use crate::voucher::Atoms;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a voucher was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The signature does not verify against the claimed signer.
    #[error("voucher signature invalid")]
    BadSignature,

    /// The voucher carries no value.
    #[error("voucher has zero atoms")]
    ZeroAtoms,

    /// The voucher is signed for a different vendor.
    #[error("voucher is signed for a different vendor")]
    WrongVendor,

    /// The nonce skips ahead of the next expected value.
    #[error("voucher nonce {got} skips ahead, expected {expected}")]
    NonceGap {
        /// Nonce the gateway expected (`prior + 1`).
        expected: u64,
        /// Nonce carried by the voucher.
        got: u64,
    },

    /// The nonce repeats or precedes an already accepted voucher.
    #[error("voucher nonce {got} was already used, latest accepted is {latest}")]
    NonceReplay {
        /// Latest nonce already accepted for the client.
        latest: u64,
        /// Nonce carried by the voucher.
        got: u64,
    },

    /// The voucher was already recorded as spent.
    #[error("voucher nonce {nonce} is already spent")]
    AlreadySpent {
        /// Nonce of the spent voucher.
        nonce: u64,
    },

    /// The client holds no active subscription to this vendor.
    #[error("client is not subscribed to this vendor")]
    NotSubscribed,

    /// The client's collateral does not cover the voucher.
    #[error("client collateral {collateral} does not cover voucher of {required} atoms")]
    InsufficientCollateral {
        /// Collateral seen on chain (after the configured risk adjustment).
        collateral: Atoms,
        /// Atoms the voucher is signed for.
        required: Atoms,
    },
}

impl Rejection {
    /// Returns the class of this rejection.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotSubscribed | Self::InsufficientCollateral { .. } => ErrorClass::Authorization,
            _ => ErrorClass::Authentication,
        }
    }
}

/// Broken accounting invariant. Always fatal for the affected client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A release would drive the locked cost below zero.
    #[error("locked cost of {client} would go negative: locked={locked}, release={release}")]
    NegativeLockedCost {
        /// Client identifier.
        client: String,
        /// Currently locked atoms.
        locked: Atoms,
        /// Atoms the caller attempted to release.
        release: Atoms,
    },

    /// A reduction would drive the unmarked cost below zero.
    #[error("unmarked cost of {client} would go negative: unmarked={unmarked}, reduce={reduce}")]
    NegativeUnmarkedCost {
        /// Client identifier.
        client: String,
        /// Current unmarked cost.
        unmarked: Atoms,
        /// Atoms the caller attempted to reduce by.
        reduce: Atoms,
    },

    /// An addition would overflow a cost counter.
    #[error("{counter} cost of {client} would overflow: current={current}, add={add}")]
    CostOverflow {
        /// Client identifier.
        client: String,
        /// Which counter (`locked` or `unmarked`).
        counter: &'static str,
        /// Current value.
        current: Atoms,
        /// Atoms the caller attempted to add.
        add: Atoms,
    },

    /// A voucher was marked spent twice.
    #[error("voucher {voucher} marked spent twice")]
    DoubleSpend {
        /// Voucher identifier.
        voucher: String,
    },

    /// Stored voucher nonces are not a gapless ascending sequence.
    #[error("nonce sequence corrupted for {client}: {detail}")]
    NonceSequence {
        /// Client identifier.
        client: String,
        /// What was found.
        detail: String,
    },

    /// A query record attempted an illegal state transition.
    #[error("query {query} cannot move from {from} to {to}")]
    QueryTransition {
        /// Query identifier.
        query: String,
        /// Current state.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },
}

/// Classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Voucher failed authentication.
    Authentication,
    /// Client is not authorized to spend (subscription, collateral).
    Authorization,
    /// Not enough credit for the request.
    Credit,
    /// A collaborator is unreachable.
    Infrastructure,
    /// Accounting state is inconsistent.
    Invariant,
    /// The request referenced something unknown or in the wrong state.
    Request,
    /// Local service failure (configuration, I/O, serialization).
    Service,
}

/// Errors that can occur in micropay-gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Voucher rejected.
    #[error("voucher rejected: {0}")]
    Rejected(#[from] Rejection),

    /// Estimated cost exceeds the client's available credit.
    #[error("insufficient credit: requested {requested}, available {available}")]
    InsufficientCredit {
        /// Estimated cost of the query.
        requested: Atoms,
        /// Credit available at the time of the check.
        available: Atoms,
    },

    /// Chain oracle failure.
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    /// Storage collaborator unavailable.
    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),

    /// Accounting invariant broken.
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// Client was halted after an invariant violation.
    #[error("client {0} is halted after an invariant violation")]
    ClientHalted(String),

    /// Session id is not known.
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// Session no longer accepts queries.
    #[error("session {0} is closed")]
    SessionClosed(String),

    /// Query id is not known.
    #[error("unknown query {0}")]
    UnknownQuery(String),

    /// Query was aborted and cannot be settled.
    #[error("query {0} was aborted")]
    QueryAborted(String),

    /// Query was settled and cannot be aborted.
    #[error("query {0} was already settled")]
    QuerySettled(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::Unavailable(msg) => Self::TrackerUnavailable(msg),
            TrackerError::Invariant(v) => Self::Invariant(v),
        }
    }
}

impl Error {
    /// Returns the class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected(r) => r.class(),
            Self::InsufficientCredit { .. } => ErrorClass::Credit,
            Self::Oracle(_) | Self::TrackerUnavailable(_) => ErrorClass::Infrastructure,
            Self::Invariant(_) | Self::ClientHalted(_) => ErrorClass::Invariant,
            Self::UnknownSession(_)
            | Self::SessionClosed(_)
            | Self::UnknownQuery(_)
            | Self::QueryAborted(_)
            | Self::QuerySettled(_) => ErrorClass::Request,
            Self::Config(_) | Self::Io(_) | Self::Serialization(_) => ErrorClass::Service,
        }
    }

    /// Returns true if processing for the affected client must stop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Invariant
    }

    /// Returns true for business-expected outcomes the caller can act on.
    #[must_use]
    pub fn is_business(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Authentication | ErrorClass::Authorization | ErrorClass::Credit
        )
    }
}
