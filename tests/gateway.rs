//! Gateway-level behaviour: routing, error kinds, restart recovery.

mod common;

use std::time::Duration;

use chainpay::{
    rpc::{bitcoind::UtxoBlock, mock::MockDaemon},
    storage::stores::{InMemory, Sqlite},
    ChainType, CoinType, Error, ErrorKind, InvoiceStatus, Network, NewInvoiceRequest,
    PaymentGatewayBuilder,
};
use common::{init_logger, utxo_block, utxo_tx, RECV_TIMEOUT, XPUB};

#[tokio::test]
async fn unknown_user_is_not_found_and_has_no_side_effects() {
    init_logger();
    let daemon = MockDaemon::<UtxoBlock>::new();
    daemon.push_block(utxo_block(10, Vec::new()));
    let gateway = PaymentGatewayBuilder::new(InMemory::new())
        .poll_interval(Duration::from_millis(50))
        .utxo_chain_with_daemon(ChainType::Btc, Network::Regtest, daemon)
        .build()
        .unwrap();
    gateway.run().await.unwrap();

    let ghost = uuid::Uuid::new_v4();
    let err = gateway
        .new_invoice(NewInvoiceRequest {
            user_id: ghost,
            coin: CoinType::Btc,
            amount: 1.0,
            timeout: Duration::from_secs(60),
            confirmations: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchUser(id) if id == ghost));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // A user registered afterwards still allocates from the cursor origin.
    let user = gateway.register_user(None).await.unwrap();
    gateway
        .update_extended_key(user, ChainType::Btc, XPUB.to_string())
        .await
        .unwrap();
    let invoice = gateway
        .new_invoice(NewInvoiceRequest {
            user_id: user,
            coin: CoinType::Btc,
            amount: 1.0,
            timeout: Duration::from_secs(60),
            confirmations: 1,
        })
        .await
        .unwrap();
    let expected = chainpay::segwit_address(
        XPUB,
        chainpay::SubIndex::new(0, 1),
        ChainType::Btc,
        Network::Regtest,
    )
    .unwrap();
    assert_eq!(invoice.crypto_address, expected);

    gateway.stop().await;
}

#[tokio::test]
async fn coins_without_a_processor_are_unsupported() {
    init_logger();
    let daemon = MockDaemon::<UtxoBlock>::new();
    daemon.push_block(utxo_block(10, Vec::new()));
    let gateway = PaymentGatewayBuilder::new(InMemory::new())
        .poll_interval(Duration::from_millis(50))
        .utxo_chain_with_daemon(ChainType::Btc, Network::Mainnet, daemon)
        .build()
        .unwrap();
    gateway.run().await.unwrap();

    let user = gateway.register_user(None).await.unwrap();
    for coin in [CoinType::Ton, CoinType::Ltc, CoinType::UsdtErc20] {
        let err = gateway
            .new_invoice(NewInvoiceRequest {
                user_id: user,
                coin,
                amount: 1.0,
                timeout: Duration::from_secs(60),
                confirmations: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedCoin(c) if c == coin));
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    gateway.stop().await;
}

#[tokio::test]
async fn keys_must_be_registered_before_invoicing() {
    init_logger();
    let daemon = MockDaemon::<UtxoBlock>::new();
    daemon.push_block(utxo_block(10, Vec::new()));
    let gateway = PaymentGatewayBuilder::new(InMemory::new())
        .poll_interval(Duration::from_millis(50))
        .utxo_chain_with_daemon(ChainType::Btc, Network::Mainnet, daemon)
        .build()
        .unwrap();
    gateway.run().await.unwrap();

    let user = gateway.register_user(None).await.unwrap();
    let err = gateway
        .new_invoice(NewInvoiceRequest {
            user_id: user,
            coin: CoinType::Btc,
            amount: 1.0,
            timeout: Duration::from_secs(60),
            confirmations: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KeysNotRegistered(ChainType::Btc)));

    // Garbage keys are rejected before they reach the store.
    let err = gateway
        .update_extended_key(user, ChainType::Btc, "not-an-xpub".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    gateway.stop().await;
}

#[tokio::test]
async fn duplicate_user_id_already_exists() {
    init_logger();
    let gateway = PaymentGatewayBuilder::new(InMemory::new())
        .build()
        .unwrap();

    let id = uuid::Uuid::new_v4();
    assert_eq!(gateway.register_user(Some(id)).await.unwrap(), id);
    let err = gateway.register_user(Some(id)).await.unwrap_err();
    assert!(matches!(err, Error::UserExists(other) if other == id));
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[tokio::test]
async fn run_twice_fails() {
    init_logger();
    let gateway = PaymentGatewayBuilder::new(InMemory::new())
        .build()
        .unwrap();
    gateway.run().await.unwrap();
    assert!(matches!(gateway.run().await, Err(Error::AlreadyRunning)));
    gateway.stop().await;
}

#[tokio::test]
async fn monero_invoices_get_fresh_subaddresses() {
    init_logger();
    // A known-consistent Monero view pair (the matching primary address is
    // 4613YiHL...dmf).
    let private_view_key = "ad2093a5705b9f33e6f0f0c1bc1f5f639c756cdfc168c8f2ac6127ccbdab3a03";
    let public_spend_key =
        "7388a06bd5455b793a82b90ae801efb9cc0da7156df8af1d5800e4315cc627b4".to_string();

    let daemon = MockDaemon::<chainpay::rpc::monerod::XmrBlock>::new();
    let gateway = PaymentGatewayBuilder::new(InMemory::new())
        .poll_interval(Duration::from_millis(50))
        .xmr_chain_with_daemon(Network::Mainnet, daemon)
        .build()
        .unwrap();
    gateway.run().await.unwrap();

    let user = gateway.register_user(None).await.unwrap();
    gateway
        .update_monero_keys(
            user,
            private_view_key.to_string(),
            public_spend_key.clone(),
        )
        .await
        .unwrap();

    let mut subscriber = gateway.subscribe();
    let invoice = gateway
        .new_invoice(NewInvoiceRequest {
            user_id: user,
            coin: CoinType::Xmr,
            amount: 0.5,
            timeout: Duration::from_secs(3600),
            confirmations: 1,
        })
        .await
        .unwrap();

    // The first invoice lands on the subaddress at index (0, 1).
    let expected = chainpay::monero_subaddress(
        private_view_key,
        &public_spend_key,
        chainpay::SubIndex::new(0, 1),
        Network::Mainnet,
    )
    .unwrap();
    assert_eq!(invoice.crypto_address, expected);
    assert!(invoice.crypto_address.starts_with('8'));

    let update = subscriber
        .recv_timeout(RECV_TIMEOUT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.status, InvoiceStatus::Pending);

    // A second invoice advances the cursor.
    let second = gateway
        .new_invoice(NewInvoiceRequest {
            user_id: user,
            coin: CoinType::Xmr,
            amount: 0.5,
            timeout: Duration::from_secs(3600),
            confirmations: 1,
        })
        .await
        .unwrap();
    assert_ne!(second.crypto_address, invoice.crypto_address);

    // Bad keys are rejected up front.
    let err = gateway
        .update_monero_keys(user, "00".to_string(), public_spend_key)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    gateway.stop().await;
}

#[tokio::test]
async fn pending_invoices_survive_restart() {
    init_logger();
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("gateway.db");
    let db_path = db_path.to_str().unwrap();

    // First life: open an invoice, then go down without a payment.
    let invoice = {
        let daemon = MockDaemon::<UtxoBlock>::new();
        daemon.push_block(utxo_block(100, Vec::new()));
        let gateway = PaymentGatewayBuilder::new(Sqlite::new(db_path).unwrap())
            .poll_interval(Duration::from_millis(50))
            .utxo_chain_with_daemon(ChainType::Btc, Network::Regtest, daemon)
            .build()
            .unwrap();
        gateway.run().await.unwrap();

        let user = gateway.register_user(None).await.unwrap();
        gateway
            .update_extended_key(user, ChainType::Btc, XPUB.to_string())
            .await
            .unwrap();
        let invoice = gateway
            .new_invoice(NewInvoiceRequest {
                user_id: user,
                coin: CoinType::Btc,
                amount: 0.2,
                timeout: Duration::from_secs(3600),
                confirmations: 1,
            })
            .await
            .unwrap();
        gateway.stop().await;
        invoice
    };

    // Second life: the pending invoice is reloaded and a payment observed
    // by the new process still confirms it.
    let daemon = MockDaemon::<UtxoBlock>::new();
    daemon.push_block(utxo_block(100, Vec::new()));
    let gateway = PaymentGatewayBuilder::new(Sqlite::new(db_path).unwrap())
        .poll_interval(Duration::from_millis(50))
        .utxo_chain_with_daemon(ChainType::Btc, Network::Regtest, daemon.clone())
        .build()
        .unwrap();
    let mut subscriber = gateway.subscribe();
    gateway.run().await.unwrap();

    // The reloaded invoice got its expiry shifted by the grace window.
    let reloaded = gateway.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, InvoiceStatus::Pending);
    assert!(reloaded.expires_at > invoice.expires_at);

    daemon.push_block(utxo_block(
        101,
        vec![utxo_tx("aa01", &invoice.crypto_address, 0.2)],
    ));
    let update = subscriber
        .recv_timeout(RECV_TIMEOUT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.id, invoice.id);
    assert_eq!(update.status, InvoiceStatus::Confirmed);
    assert_eq!(update.actual_amount, Some(0.2));

    gateway.stop().await;
}
