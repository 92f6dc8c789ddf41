use chrono::NaiveDate;

use crate::types::Candle;

/// What a fetch task retrieves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    Candles,
    OwnershipIndividual,
    OwnershipCorporate,
    Financials,
    RetailFlow,
    BrokerFlow,
}

impl FetchKind {
    /// Tag used as the dedup-key prefix.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Candles => "CANDLES",
            Self::OwnershipIndividual => "OWN_INDIV",
            Self::OwnershipCorporate => "OWN_CORP",
            Self::Financials => "FINANCIALS",
            Self::RetailFlow => "RITEL",
            Self::BrokerFlow => "BROKER",
        }
    }
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One unit of work for the fetch worker.  Owned by the coordinator from
/// submission until the worker drains it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTask {
    pub kind: FetchKind,
    pub symbol: String,
    /// Broker code for [`FetchKind::BrokerFlow`].
    pub extra: Option<String>,
    /// Inclusive date range for candle fetches.
    pub range: Option<(NaiveDate, NaiveDate)>,
    /// Host-preloaded bars merged before the fetched ones.
    pub preload: Vec<Candle>,
}

impl FetchTask {
    pub fn candles(
        symbol: impl Into<String>,
        from: NaiveDate,
        to: NaiveDate,
        preload: Vec<Candle>,
    ) -> Self {
        Self {
            kind: FetchKind::Candles,
            symbol: symbol.into(),
            extra: None,
            range: Some((from, to)),
            preload,
        }
    }

    /// Ownership, financials or retail-flow task.
    pub fn side(kind: FetchKind, symbol: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            extra: None,
            range: None,
            preload: Vec::new(),
        }
    }

    pub fn broker_flow(symbol: impl Into<String>, broker_code: impl Into<String>) -> Self {
        Self {
            kind: FetchKind::BrokerFlow,
            symbol: symbol.into(),
            extra: Some(broker_code.into()),
            range: None,
            preload: Vec::new(),
        }
    }

    /// Deterministic single-flight key, e.g. `CANDLES_BBCA` or
    /// `BROKER_YP_BBCA`.
    pub fn dedup_key(&self) -> String {
        match (&self.kind, &self.extra) {
            (FetchKind::BrokerFlow, Some(code)) => {
                format!("{}_{}_{}", self.kind.tag(), code, self.symbol)
            }
            _ => format!("{}_{}", self.kind.tag(), self.symbol),
        }
    }
}
