use tokio_stream::{Stream, StreamExt};

use super::{Payout, WalletEngine, WalletError};
use crate::Amount;
use crate::model::{DealId, UserId};

/// One wallet operation, as replayed from a ledger file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletCommand {
    Deposit {
        user: UserId,
        amount: Amount,
    },
    Withdrawal {
        user: UserId,
        amount: Amount,
    },
    Freeze {
        user: UserId,
        deal: DealId,
        amount: Amount,
    },
    CancelEarly {
        user: UserId,
        deal: DealId,
        amount: Amount,
    },
    CancelWithPenalty {
        client: UserId,
        contractor: UserId,
        deal: DealId,
        amount: Amount,
    },
    /// The commission tier comes from the contractor's payout history.
    Complete {
        client: UserId,
        contractor: UserId,
        deal: DealId,
        amount: Amount,
    },
}

impl WalletEngine {
    /// Apply every command from the stream in order.
    pub async fn run(&self, mut stream: impl Stream<Item = WalletCommand> + Unpin) {
        while let Some(command) = stream.next().await {
            // a rejected command never stops the replay; it is already logged
            let _ = self.apply(command).await;
        }
    }

    pub async fn apply(&self, command: WalletCommand) -> Result<(), WalletError> {
        match command {
            WalletCommand::Deposit { user, amount } => {
                self.add_balance(&user, amount).await?;
            }
            WalletCommand::Withdrawal { user, amount } => {
                self.withdraw(&user, amount).await?;
            }
            WalletCommand::Freeze { user, deal, amount } => {
                self.freeze_for_deal(&user, &deal, amount).await?;
            }
            WalletCommand::CancelEarly { user, deal, amount } => {
                self.cancel_early(&user, &deal, amount).await?;
            }
            WalletCommand::CancelWithPenalty {
                client,
                contractor,
                deal,
                amount,
            } => {
                self.cancel_with_penalty(&client, &contractor, &deal, amount)
                    .await?;
            }
            WalletCommand::Complete {
                client,
                contractor,
                deal,
                amount,
            } => {
                let completed_before = self.completed_payouts(&contractor).await?;
                self.complete_and_pay(&Payout {
                    deal_id: deal,
                    client_id: client,
                    contractor_id: contractor,
                    price: amount,
                    completed_before,
                    adjustment: Amount::ZERO,
                })
                .await?;
            }
        }
        Ok(())
    }
}
