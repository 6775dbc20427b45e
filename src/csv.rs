use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::model::{DealId, UserId};
use crate::wallet::{Wallet, WalletCommand};

/// Errors that can occur when reading a ledger file or writing balances
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("cannot open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{kind}'")]
    UnrecognizedType { line: usize, kind: String },

    #[error("line {line}: {kind} missing {field}")]
    MissingField {
        line: usize,
        kind: String,
        field: &'static str,
    },

    #[error("failed to write csv row: {0}")]
    Write(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    user: UserId,
    counterparty: Option<UserId>,
    deal: Option<DealId>,
    amount: Option<Amount>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    user: &'a str,
    balance: Amount,
    frozen: Amount,
    total: Amount,
}

impl InputRow {
    fn require<T>(
        value: Option<T>,
        line: usize,
        kind: &str,
        field: &'static str,
    ) -> Result<T, CsvError> {
        value.ok_or_else(|| CsvError::MissingField {
            line,
            kind: kind.to_string(),
            field,
        })
    }

    fn into_command(self, line: usize) -> Result<WalletCommand, CsvError> {
        let kind = self.r#type.as_str();
        let deal = self.deal.filter(|d| !d.is_empty());
        let counterparty = self.counterparty.filter(|c| !c.is_empty());
        let amount = Self::require(self.amount, line, kind, "amount")?;
        let command = match kind {
            "deposit" => WalletCommand::Deposit {
                user: self.user,
                amount,
            },
            "withdrawal" => WalletCommand::Withdrawal {
                user: self.user,
                amount,
            },
            "freeze" => WalletCommand::Freeze {
                user: self.user,
                deal: Self::require(deal, line, kind, "deal")?,
                amount,
            },
            "cancel_early" => WalletCommand::CancelEarly {
                user: self.user,
                deal: Self::require(deal, line, kind, "deal")?,
                amount,
            },
            "cancel_penalty" => WalletCommand::CancelWithPenalty {
                client: self.user,
                contractor: Self::require(counterparty, line, kind, "counterparty")?,
                deal: Self::require(deal, line, kind, "deal")?,
                amount,
            },
            "complete" => WalletCommand::Complete {
                client: self.user,
                contractor: Self::require(counterparty, line, kind, "counterparty")?,
                deal: Self::require(deal, line, kind, "deal")?,
                amount,
            },
            other => {
                return Err(CsvError::UnrecognizedType {
                    line,
                    kind: other.to_string(),
                });
            }
        };
        Ok(command)
    }
}

/// Read wallet commands from a ledger csv file.
///
/// Columns are `type,user,counterparty,deal,amount`. Rows that fail to parse
/// come back as errors without stopping the iterator.
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<WalletCommand, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            // an unknown type wins over a missing field
            match row.r#type.as_str() {
                "deposit" | "withdrawal" | "freeze" | "cancel_early" | "cancel_penalty"
                | "complete" => row.into_command(line),
                other => Err(CsvError::UnrecognizedType {
                    line,
                    kind: other.to_string(),
                }),
            }
        }))
}

/// Write wallet balances in csv format
pub fn write_wallets<'a>(
    writer: impl io::Write,
    wallets: impl IntoIterator<Item = &'a Wallet>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for wallet in wallets {
        writer.serialize(OutputRow {
            user: &wallet.user_id,
            balance: wallet.balance,
            frozen: wallet.frozen.total,
            total: wallet.total(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
