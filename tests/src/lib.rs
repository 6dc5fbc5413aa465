#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    use mixer_client::{
        EngineConfig, LedgerEvent, LedgerSnapshot, MemoryLedger, Mixer, RecordStore, StoreKey,
    };
    use mixer_lib::*;
    use rand::seq::SliceRandom;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn recipient() -> Recipient {
        "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".parse().unwrap()
    }

    async fn start(ledger: &Arc<MemoryLedger>) -> Mixer<MemoryLedger> {
        Mixer::start(RecordStore::temporary().unwrap(), ledger.clone(), EngineConfig::default())
            .await
            .unwrap()
    }

    /// Block until a published snapshot satisfies `predicate`.
    async fn wait_for<F>(mixer: &Mixer<MemoryLedger>, mut predicate: F) -> Arc<LedgerSnapshot>
    where
        F: FnMut(&LedgerSnapshot) -> bool,
    {
        let mut rx = mixer.watch_state();
        let snapshot = tokio::time::timeout(TIMEOUT, rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for state")
            .expect("engine stopped");
        Arc::clone(&snapshot)
    }

    /// Poll an async condition until it holds.
    async fn until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(TIMEOUT, async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    /// Push a marker event and wait for it, so every event emitted before it
    /// has been applied. The marker shows up as one observed 1.0 deposit.
    async fn drain_events(ledger: &MemoryLedger, mixer: &Mixer<MemoryLedger>) {
        let marker = Digest(rand::random());
        ledger
            .emit(LedgerEvent::DepositConfirmed {
                commitment: marker,
                block_timestamp: 1,
            })
            .await;
        wait_for(mixer, |s| s.deposit(&marker).is_some()).await;
    }

    async fn confirmed_deposit(mixer: &Mixer<MemoryLedger>) -> Digest {
        let commitment = mixer.deposit(Amount::ether(1), recipient()).await.unwrap();
        let status = mixer.state().unwrap().deposit(&commitment).unwrap().status;
        assert_eq!(status, CommitmentStatus::Confirmed);
        commitment
    }

    // ── Deposit then confirmation ────────────────────────────────────

    #[tokio::test]
    async fn test_deposit_pending_until_confirmed() -> anyhow::Result<()> {
        let ledger = Arc::new(MemoryLedger::manual());
        let mixer = Arc::new(start(&ledger).await);

        let task = {
            let mixer = mixer.clone();
            tokio::spawn(async move { mixer.deposit(Amount::ether(1), recipient()).await })
        };

        let pending = wait_for(&mixer, |s| !s.deposits.is_empty()).await;
        assert_eq!(pending.deposits[0].status, CommitmentStatus::Pending);
        assert_eq!(pending.total_deposited, Amount::ether(1));
        let commitment = pending.deposits[0].commitment;

        // The secret is held locally but never appears in published state
        let record = mixer.store().get(&commitment)?.expect("record stored");
        let secret = record.secret.expect("local deposit keeps its secret");
        let json = serde_json::to_string(&*pending)?;
        assert!(!json.contains(&hex::encode(secret.expose())));
        assert_eq!(commitment, commitment_of(&recipient(), &secret));

        until(|| async { ledger.deposits().await.len() == 1 }).await;
        ledger.mine_pending().await;
        assert_eq!(task.await??, commitment);

        let state = mixer.state()?;
        let view = state.deposit(&commitment).unwrap();
        assert_eq!(view.status, CommitmentStatus::Confirmed);
        assert!(!view.approximate);
        assert_eq!(state.total_deposited.to_string(), "1.0");
        Ok(())
    }

    // ── Withdrawing an unconfirmed deposit ───────────────────────────

    #[tokio::test]
    async fn test_withdraw_unconfirmed_rejected() {
        let ledger = Arc::new(MemoryLedger::manual());
        let mixer = Arc::new(start(&ledger).await);

        let task = {
            let mixer = mixer.clone();
            tokio::spawn(async move { mixer.deposit(Amount::ether(1), recipient()).await })
        };
        let commitment = wait_for(&mixer, |s| !s.deposits.is_empty()).await.deposits[0].commitment;

        let err = mixer.withdraw(commitment).await.unwrap_err();
        assert_eq!(err, MixerError::NotYetConfirmed(commitment));
        assert!(mixer.store().list_withdrawals().unwrap().is_empty());
        assert!(ledger.withdrawals().await.is_empty());
        let record = mixer.store().get(&commitment).unwrap().unwrap();
        assert_eq!(record.status, CommitmentStatus::Pending);
        assert!(record.secret.is_some());

        until(|| async { ledger.deposits().await.len() == 1 }).await;
        ledger.mine_pending().await;
        task.await.unwrap().unwrap();
    }

    // ── Full withdrawal ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_withdraw_confirmed_erases_secret() {
        let ledger = Arc::new(MemoryLedger::new());
        let mixer = start(&ledger).await;
        let commitment = confirmed_deposit(&mixer).await;

        let nullifier = mixer.withdraw(commitment).await.unwrap();
        assert_eq!(ledger.withdrawals().await, vec![(nullifier, recipient())]);

        let record = mixer.store().get(&commitment).unwrap().unwrap();
        assert_eq!(record.status, CommitmentStatus::Withdrawn);
        assert!(record.secret.is_none());

        let state = mixer.state().unwrap();
        let withdrawal = state.withdrawal(&nullifier).unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Confirmed);
        assert_eq!(withdrawal.commitment, Some(commitment));
        assert!(withdrawal.confirmed_at.is_some());
        assert_eq!(state.total_deposited, Amount::ether(1));
        assert_eq!(state.total_withdrawn, Amount::ether(1));

        // Spent: a second withdrawal has nothing to work with
        assert_eq!(
            mixer.withdraw(commitment).await.unwrap_err(),
            MixerError::UnknownCommitment(commitment)
        );
    }

    // ── Duplicate deposit confirmations ──────────────────────────────

    #[tokio::test]
    async fn test_duplicate_deposit_events_absorbed() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_duplicate_delivery(true).await;
        let mixer = start(&ledger).await;
        let commitment = confirmed_deposit(&mixer).await;

        for _ in 0..3 {
            ledger
                .emit(LedgerEvent::DepositConfirmed {
                    commitment,
                    block_timestamp: 1_700_000_100,
                })
                .await;
        }
        drain_events(&ledger, &mixer).await;

        let state = mixer.state().unwrap();
        let matching = state.deposits.iter().filter(|d| d.commitment == commitment).count();
        assert_eq!(matching, 1);
        assert_eq!(state.deposit(&commitment).unwrap().status, CommitmentStatus::Confirmed);
        // Our deposit plus the drain marker
        assert_eq!(state.total_deposited, Amount::ether(2));
    }

    // ── Withdrawal seen only on the ledger ───────────────────────────

    #[tokio::test]
    async fn test_detached_withdrawal_recorded() {
        let ledger = Arc::new(MemoryLedger::new());
        let mixer = start(&ledger).await;
        let nullifier = Digest([0xEE; 32]);

        ledger
            .emit(LedgerEvent::WithdrawalConfirmed {
                nullifier,
                recipient: recipient(),
                block_timestamp: 1_700_000_500,
            })
            .await;
        let state = wait_for(&mixer, |s| s.withdrawal(&nullifier).is_some()).await;

        let view = state.withdrawal(&nullifier).unwrap();
        assert_eq!(view.status, WithdrawalStatus::Confirmed);
        assert_eq!(view.commitment, None);
        assert_eq!(view.amount, Amount::ether(1));
        assert_eq!(view.confirmed_at, Some(1_700_000_500_000));
        assert!(view.approximate);
        assert_eq!(state.total_withdrawn, Amount::ether(1));
        assert!(state.deposits.is_empty());
    }

    // ── Properties ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_withdrawn_never_regresses() {
        let ledger = Arc::new(MemoryLedger::new());
        let mixer = start(&ledger).await;
        let commitment = confirmed_deposit(&mixer).await;
        let nullifier = mixer.withdraw(commitment).await.unwrap();

        ledger
            .emit(LedgerEvent::DepositConfirmed {
                commitment,
                block_timestamp: 1,
            })
            .await;
        ledger
            .emit(LedgerEvent::WithdrawalConfirmed {
                nullifier,
                recipient: recipient(),
                block_timestamp: 2,
            })
            .await;
        drain_events(&ledger, &mixer).await;

        let record = mixer.store().get(&commitment).unwrap().unwrap();
        assert_eq!(record.status, CommitmentStatus::Withdrawn);
        assert!(record.secret.is_none());
        let withdrawal = mixer.store().get_withdrawal(&nullifier).unwrap().unwrap();
        assert_ne!(withdrawal.confirmed_at, Some(2_000));
        assert_eq!(mixer.state().unwrap().total_withdrawn, Amount::ether(1));
    }

    #[tokio::test]
    async fn test_aggregate_under_shuffled_duplicates() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_duplicate_delivery(true).await;
        let mixer = start(&ledger).await;

        let mut events = Vec::new();
        for i in 0..6u8 {
            events.push(LedgerEvent::DepositConfirmed {
                commitment: Digest([i; 32]),
                block_timestamp: 1_000 + u64::from(i),
            });
        }
        for i in 0..4u8 {
            events.push(LedgerEvent::WithdrawalConfirmed {
                nullifier: Digest([0x80 + i; 32]),
                recipient: recipient(),
                block_timestamp: 2_000 + u64::from(i),
            });
        }
        let mut delivery: Vec<LedgerEvent> = events.iter().chain(events.iter()).cloned().collect();
        delivery.shuffle(&mut rand::thread_rng());
        for event in delivery {
            ledger.emit(event).await;
        }
        drain_events(&ledger, &mixer).await;

        let state = mixer.state().unwrap();
        assert_eq!(state.deposits.len(), 7);
        assert_eq!(state.withdrawals.len(), 4);
        assert_eq!(state.total_deposited, Amount::ether(7));
        assert_eq!(state.total_withdrawn, Amount::ether(4));
        let confirmed: Vec<u64> = state.withdrawals.iter().filter_map(|w| w.confirmed_at).collect();
        assert_eq!(confirmed, vec![2_003_000, 2_002_000, 2_001_000, 2_000_000]);
        // The published snapshot agrees with a fresh read
        assert_eq!(**mixer.watch_state().borrow(), state);
    }

    #[tokio::test]
    async fn test_observed_deposit_uses_configured_unit() {
        let ledger = Arc::new(MemoryLedger::new());
        let config = EngineConfig {
            deposit_unit: "0.1".parse().unwrap(),
            ..EngineConfig::default()
        };
        let mixer = Mixer::start(RecordStore::temporary().unwrap(), ledger.clone(), config)
            .await
            .unwrap();
        let commitment = Digest([0x0B; 32]);

        ledger
            .emit(LedgerEvent::DepositConfirmed {
                commitment,
                block_timestamp: 1_700_000_000,
            })
            .await;
        let state = wait_for(&mixer, |s| s.deposit(&commitment).is_some()).await;
        let view = state.deposit(&commitment).unwrap();
        assert!(view.approximate);
        assert_eq!(view.amount.to_string(), "0.1");
        assert_eq!(view.recipient, None);
        assert_eq!(view.created_at, 1_700_000_000_000);

        assert_eq!(
            mixer.withdraw(commitment).await.unwrap_err(),
            MixerError::UnknownCommitment(commitment)
        );
    }

    // ── Failure handling ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_concurrent_withdrawal_in_flight() {
        let ledger = Arc::new(MemoryLedger::manual());
        let mixer = Arc::new(start(&ledger).await);

        let deposit = {
            let mixer = mixer.clone();
            tokio::spawn(async move { mixer.deposit(Amount::ether(1), recipient()).await })
        };
        until(|| async { ledger.deposits().await.len() == 1 }).await;
        ledger.mine_pending().await;
        let commitment = deposit.await.unwrap().unwrap();

        let first = {
            let mixer = mixer.clone();
            tokio::spawn(async move { mixer.withdraw(commitment).await })
        };
        until(|| async { ledger.withdrawals().await.len() == 1 }).await;

        let err = mixer.withdraw(commitment).await.unwrap_err();
        assert!(matches!(err, MixerError::InFlight(_)), "got {err:?}");
        assert_eq!(ledger.withdrawals().await.len(), 1);

        ledger.mine_pending().await;
        let nullifier = first.await.unwrap().unwrap();
        assert_eq!(err, MixerError::InFlight(nullifier));
        let status = mixer.store().get(&commitment).unwrap().unwrap().status;
        assert_eq!(status, CommitmentStatus::Withdrawn);
    }

    #[tokio::test]
    async fn test_rejected_deposit_can_be_resubmitted() {
        let ledger = Arc::new(MemoryLedger::new());
        let mixer = start(&ledger).await;

        ledger.set_reject_submissions(true).await;
        let err = mixer.deposit(Amount::ether(1), recipient()).await.unwrap_err();
        assert!(matches!(err, MixerError::SubmissionFailed(_)));

        let commitment = mixer.prepare_deposit(Amount::ether(1), recipient()).await.unwrap();
        assert!(ledger.deposits().await.is_empty());
        let err = mixer.resubmit_deposit(commitment).await.unwrap_err();
        assert!(matches!(err, MixerError::SubmissionFailed(_)));

        let state = mixer.state().unwrap();
        assert_eq!(state.deposits.len(), 2);
        assert_eq!(state.deposit(&commitment).unwrap().status, CommitmentStatus::Pending);

        ledger.set_reject_submissions(false).await;
        mixer.resubmit_deposit(commitment).await.unwrap();
        let status = mixer.state().unwrap().deposit(&commitment).unwrap().status;
        assert_eq!(status, CommitmentStatus::Confirmed);

        // Nothing left to resubmit
        mixer.resubmit_deposit(commitment).await.unwrap();
        assert_eq!(ledger.deposits().await.len(), 1);
        assert_eq!(
            mixer.resubmit_deposit(Digest([1; 32])).await.unwrap_err(),
            MixerError::UnknownCommitment(Digest([1; 32]))
        );
    }

    #[tokio::test]
    async fn test_confirmation_timeout_leaves_pending() {
        let ledger = Arc::new(MemoryLedger::manual().with_confirmation_timeout(Duration::from_millis(50)));
        let mixer = start(&ledger).await;

        let commitment = mixer.prepare_deposit(Amount::ether(1), recipient()).await.unwrap();
        let err = mixer.resubmit_deposit(commitment).await.unwrap_err();
        assert_eq!(err, MixerError::ConfirmationTimeout { waited_ms: 50 });
        let record = mixer.store().get(&commitment).unwrap().unwrap();
        assert_eq!(record.status, CommitmentStatus::Pending);

        // The confirmation arrives later through the event stream
        ledger.mine_pending().await;
        let state = wait_for(&mixer, |s| {
            s.deposit(&commitment).map(|d| d.status) == Some(CommitmentStatus::Confirmed)
        })
        .await;
        assert_eq!(state.deposits.len(), 1);
    }

    #[tokio::test]
    async fn test_deposit_retry_after_timeout_funds_once() {
        let ledger = Arc::new(MemoryLedger::manual().with_confirmation_timeout(Duration::from_millis(50)));
        let mixer = start(&ledger).await;

        let commitment = mixer.prepare_deposit(Amount::ether(1), recipient()).await.unwrap();
        for _ in 0..2 {
            let err = mixer.resubmit_deposit(commitment).await.unwrap_err();
            assert_eq!(err, MixerError::ConfirmationTimeout { waited_ms: 50 });
        }
        assert_eq!(ledger.deposits().await.len(), 1);
        let record = mixer.store().get(&commitment).unwrap().unwrap();
        assert!(record.tx_hash.is_some());

        ledger.mine_pending().await;
        mixer.resubmit_deposit(commitment).await.unwrap();
        let state = wait_for(&mixer, |s| {
            s.deposit(&commitment).map(|d| d.status) == Some(CommitmentStatus::Confirmed)
        })
        .await;
        assert_eq!(ledger.deposits().await.len(), 1);
        assert_eq!(state.total_deposited, Amount::ether(1));
    }

    #[tokio::test]
    async fn test_withdraw_retry_waits_on_accepted_transaction() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mixer-db");
        let key = StoreKey::from_bytes(rand::random());
        let ledger = Arc::new(MemoryLedger::manual().with_confirmation_timeout(Duration::from_millis(50)));

        let (commitment, nullifier) = {
            let mixer = Mixer::start(RecordStore::open(&path, &key)?, ledger.clone(), EngineConfig::default()).await?;
            let commitment = mixer.prepare_deposit(Amount::ether(1), recipient()).await?;
            ledger
                .emit(LedgerEvent::DepositConfirmed {
                    commitment,
                    block_timestamp: 1,
                })
                .await;
            wait_for(&mixer, |s| {
                s.deposit(&commitment).map(|d| d.status) == Some(CommitmentStatus::Confirmed)
            })
            .await;

            for _ in 0..2 {
                let err = mixer.withdraw(commitment).await.unwrap_err();
                assert_eq!(err, MixerError::ConfirmationTimeout { waited_ms: 50 });
            }
            let submitted = ledger.withdrawals().await;
            assert_eq!(submitted.len(), 1);
            let nullifier = submitted[0].0;
            assert!(mixer.store().get_withdrawal(&nullifier)?.unwrap().tx_hash.is_some());
            mixer.shutdown().await;
            (commitment, nullifier)
        };

        // Mined while no engine was listening; the next engine resumes the
        // accepted transaction instead of spending the nullifier again
        assert_eq!(ledger.mine_pending().await, 1);
        let mixer = Mixer::start(RecordStore::open(&path, &key)?, ledger.clone(), EngineConfig::default()).await?;
        assert_eq!(mixer.withdraw(commitment).await?, nullifier);
        assert_eq!(ledger.withdrawals().await.len(), 1);

        let record = mixer.store().get(&commitment)?.unwrap();
        assert_eq!(record.status, CommitmentStatus::Withdrawn);
        assert!(record.secret.is_none());
        assert_eq!(mixer.state()?.total_withdrawn, Amount::ether(1));
        mixer.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_reverted_withdrawal_retry() {
        let ledger = Arc::new(MemoryLedger::new());
        let mixer = start(&ledger).await;
        let commitment = confirmed_deposit(&mixer).await;

        ledger.set_revert_transactions(true).await;
        let err = mixer.withdraw(commitment).await.unwrap_err();
        assert!(matches!(err, MixerError::SubmissionFailed(_)));

        let record = mixer.store().get(&commitment).unwrap().unwrap();
        assert_eq!(record.status, CommitmentStatus::Confirmed);
        assert!(record.secret.is_some());
        let pending = mixer.store().list_withdrawals().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, WithdrawalStatus::Pending);
        assert_eq!(mixer.state().unwrap().total_withdrawn, Amount::ZERO);

        ledger.set_revert_transactions(false).await;
        let nullifier = mixer.withdraw(commitment).await.unwrap();
        assert_eq!(nullifier, pending[0].nullifier);
        let withdrawals = mixer.store().list_withdrawals().unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].status, WithdrawalStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_invalid_deposit_writes_nothing() {
        let ledger = Arc::new(MemoryLedger::new());
        let mixer = start(&ledger).await;

        let err = mixer.deposit(Amount::ZERO, recipient()).await.unwrap_err();
        assert!(matches!(err, MixerError::InvalidInput(_)));
        let err = mixer.deposit(Amount::ether(1), Recipient([0; 20])).await.unwrap_err();
        assert!(matches!(err, MixerError::InvalidInput(_)));
        let err = mixer.prepare_deposit(Amount::ZERO, recipient()).await.unwrap_err();
        assert!(matches!(err, MixerError::InvalidInput(_)));

        assert!(mixer.state().unwrap().deposits.is_empty());
        assert!(ledger.deposits().await.is_empty());
        assert_eq!(
            mixer.withdraw(Digest([7; 32])).await.unwrap_err(),
            MixerError::UnknownCommitment(Digest([7; 32]))
        );
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_shutdown_unsubscribes() {
        let ledger = Arc::new(MemoryLedger::new());
        let mixer = start(&ledger).await;
        assert_eq!(ledger.subscriber_count().await, 1);
        let commitment = confirmed_deposit(&mixer).await;

        mixer.shutdown().await;
        mixer.shutdown().await;
        assert_eq!(ledger.subscriber_count().await, 0);

        assert_eq!(
            mixer.deposit(Amount::ether(1), recipient()).await.unwrap_err(),
            MixerError::EngineStopped
        );
        assert_eq!(mixer.withdraw(commitment).await.unwrap_err(), MixerError::EngineStopped);
        // Reads go straight to the store
        assert_eq!(mixer.state().unwrap().deposits.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_engine_unsubscribes() {
        let ledger = Arc::new(MemoryLedger::new());
        let mixer = start(&ledger).await;
        assert_eq!(ledger.subscriber_count().await, 1);

        drop(mixer);
        until(|| async { ledger.subscriber_count().await == 0 }).await;

        // Events after the drop have nowhere to go
        ledger
            .emit(LedgerEvent::DepositConfirmed {
                commitment: Digest([3; 32]),
                block_timestamp: 1,
            })
            .await;
    }

    #[tokio::test]
    async fn test_records_survive_restart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mixer-db");
        let key = StoreKey::from_bytes(rand::random());

        let commitment = {
            let ledger = Arc::new(MemoryLedger::new());
            let mixer = Mixer::start(RecordStore::open(&path, &key)?, ledger, EngineConfig::default()).await?;
            let commitment = mixer.deposit(Amount::ether(1), recipient()).await?;
            mixer.shutdown().await;
            commitment
        };

        let ledger = Arc::new(MemoryLedger::new());
        let mixer = Mixer::start(RecordStore::open(&path, &key)?, ledger.clone(), EngineConfig::default()).await?;
        let state = mixer.state()?;
        assert_eq!(state.deposit(&commitment).map(|d| d.status), Some(CommitmentStatus::Confirmed));
        assert_eq!(**mixer.watch_state().borrow(), state);

        // The sealed secret came back with the record
        let nullifier = mixer.withdraw(commitment).await?;
        assert_eq!(ledger.withdrawals().await, vec![(nullifier, recipient())]);
        mixer.shutdown().await;
        Ok(())
    }
}
