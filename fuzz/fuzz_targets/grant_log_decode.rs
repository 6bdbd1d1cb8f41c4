//! Fuzz harness for the `GrantAdmission` payload decoder.
//!
//! Log data arrives from an untrusted provider. Arbitrary bytes must decode
//! to a passphrase or a [`LogDecodeError`], never panic, and a successful
//! decode must survive re-encoding unchanged.

#![no_main]
use clubhouse_daemon::ledger::RawLog;
use clubhouse_daemon::ledger::abi::{
    decode_grant_passphrase, decode_string, encode_grant_passphrase,
};
use libfuzzer_sys::fuzz_target;

const TOPIC: &str = "0xa7a185385c503e9ada3e526a11ca7fb6c7cdb34ebe2f6fc67f0582e34ab6ea67";

fuzz_target!(|data: &[u8]| {
    if let Ok(passphrase) = decode_string(data) {
        let log = RawLog {
            address: String::new(),
            topics: vec![TOPIC.to_string()],
            data: encode_grant_passphrase(&passphrase),
            block_number: None,
            transaction_hash: None,
            log_index: None,
        };
        assert_eq!(decode_grant_passphrase(&log, TOPIC).as_deref(), Ok(passphrase.as_str()));
    }

    // Same bytes through the hex path, as a provider would deliver them.
    if let Ok(text) = std::str::from_utf8(data) {
        let log = RawLog {
            address: String::new(),
            topics: vec![TOPIC.to_string()],
            data: text.to_string(),
            block_number: Some(1),
            transaction_hash: None,
            log_index: None,
        };
        let _ = decode_grant_passphrase(&log, TOPIC);
    }
});
