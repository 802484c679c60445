//! Label dispatch
//!
//! Builds a ZPL payload embedding the record's code and identity fields and
//! sends it to a network label printer. A failed or slow printer marks the
//! record `print_failed` and never delays the cycle-creation path; a manual
//! reprint re-invokes the same contract.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{LabelIdentity, PrinterConfig};
use crate::core::types::{CycleRecord, PrintState};
use crate::error::{CycleSrvError, Result};
use crate::store::CycleStore;

/// Network label printer driver
pub struct LabelDispatcher;

impl LabelDispatcher {
    /// Render the ZPL command for one cycle record
    pub fn build_zpl(record: &CycleRecord, identity: &LabelIdentity, footer: Option<&str>) -> String {
        let mfg_date = record.created_at.format("%m%y").to_string();
        // The serial segment is the tail of the code
        let serial: String = record
            .code
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let mut zpl = format!(
            "^XA\n\
             ^PW591\n\
             ^LL300\n\
             ~SD15\n\
             \n\
             ^FO50,60\n\
             ^BQN,2,5\n\
             ^FDLA,{code}^FS\n\
             \n\
             ^FO220,35^A0N,32,32^FD{part_no}^FS\n\
             ^FO220,68^A0N,32,32^FD{revision}^FS\n\
             ^FO220,101^A0N,32,32^FD{vendor_code}^FS\n\
             ^FO220,134^A0N,32,32^FD{mfg_date}^FS\n\
             ^FO220,167^A0N,32,32^FD{serial}^FS\n\
             \n\
             ^FO0,210\n\
             ^FB591,1,0,C,0\n\
             ^A0N,32,32\n\
             ^FD{part_desc}^FS\n",
            code = record.code,
            part_no = identity.part_no,
            revision = identity.revision,
            vendor_code = identity.vendor_code,
            mfg_date = mfg_date,
            serial = serial,
            part_desc = identity.part_name,
        );
        if let Some(footer) = footer {
            zpl.push_str(&format!(
                "\n^FO0,250\n^FB591,1,0,C,0\n^A0N,32,32\n^FD{footer}^FS\n"
            ));
        }
        zpl.push_str("^XZ");
        zpl
    }

    /// Send a rendered payload to the printer.
    ///
    /// Success means the bytes were flushed; no application-level
    /// acknowledgment exists. Both connect and send honour the configured
    /// timeout so an unreachable printer stalls the caller for a bounded
    /// duration only.
    pub async fn send(printer: &PrinterConfig, payload: &[u8]) -> Result<()> {
        let addr = format!("{}:{}", printer.host, printer.port);
        let send_timeout: Duration = printer.timeout();

        let mut stream = match timeout(send_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CycleSrvError::print(format!(
                    "Failed to connect to printer {addr}: {e}"
                )))
            },
            Err(_) => {
                return Err(CycleSrvError::print(format!(
                    "Connection to printer {addr} timed out"
                )))
            },
        };

        match timeout(send_timeout, async {
            stream.write_all(payload).await?;
            stream.flush().await?;
            stream.shutdown().await
        })
        .await
        {
            Ok(Ok(())) => {
                debug!("Sent {} bytes to printer {addr}", payload.len());
                Ok(())
            },
            Ok(Err(e)) => Err(CycleSrvError::print(format!(
                "Send to printer {addr} failed: {e}"
            ))),
            Err(_) => Err(CycleSrvError::print(format!(
                "Send to printer {addr} timed out"
            ))),
        }
    }

    /// Print a cycle record and persist the resulting print status.
    ///
    /// Never fails the calling path: dispatch errors are logged, the record
    /// is marked `print_failed`, and no automatic retry happens here.
    pub async fn dispatch(
        printer: Option<&PrinterConfig>,
        store: &dyn CycleStore,
        record: &CycleRecord,
        identity: &LabelIdentity,
    ) -> PrintState {
        let Some(printer) = printer else {
            debug!(
                "No printer configured for station {}, leaving cycle {} unprinted",
                record.station_code, record.cycle_number
            );
            return PrintState::Unprinted;
        };

        let payload = Self::build_zpl(record, identity, printer.footer.as_deref());
        let state = match Self::send(printer, payload.as_bytes()).await {
            Ok(()) => {
                info!(
                    "Label for cycle {} sent to {}:{}",
                    record.cycle_number, printer.host, printer.port
                );
                PrintState::Printed
            },
            Err(e) => {
                warn!("Label for cycle {} not printed: {}", record.cycle_number, e);
                PrintState::PrintFailed
            },
        };

        if let Err(e) = store.update_print_state(record.id, state).await {
            warn!(
                "Failed to persist print status for cycle {}: {}",
                record.cycle_number, e
            );
        }
        state
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::types::{CycleResult, ScanState};
    use crate::store::{CycleStore, MemoryStore};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tokio::io::AsyncReadExt;

    fn identity() -> LabelIdentity {
        LabelIdentity {
            part_name: "CLUTCH ASSEMBLY".into(),
            part_no: "CLU44001".into(),
            revision: "B".into(),
            vendor_code: "V100".into(),
        }
    }

    fn record(code: &str) -> CycleRecord {
        CycleRecord {
            id: 1,
            station_id: 1,
            station_code: "CLU-01".into(),
            sequence: 1,
            cycle_number: "CLU-01-000001".into(),
            created_at: Utc::now(),
            fields: BTreeMap::new(),
            result: CycleResult::Ok,
            barcode: code.to_string(),
            code: code.to_string(),
            print_state: PrintState::Unprinted,
            scan_state: ScanState::Unscanned,
        }
    }

    async fn stored_record(store: &MemoryStore, code: &str) -> CycleRecord {
        let r = record(code);
        store
            .create_cycle(crate::core::types::NewCycle {
                station_id: r.station_id,
                station_code: r.station_code.clone(),
                sequence: r.sequence,
                cycle_number: r.cycle_number.clone(),
                created_at: r.created_at,
                fields: r.fields.clone(),
                result: r.result,
                barcode: r.barcode.clone(),
                code: r.code.clone(),
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_zpl_embeds_code_and_identity() {
        let r = record("CLU44001BV1000826000001000000000");
        let zpl = LabelDispatcher::build_zpl(&r, &identity(), Some("ACME INDUSTRIAL"));
        assert!(zpl.starts_with("^XA"));
        assert!(zpl.ends_with("^XZ"));
        assert!(zpl.contains("^FDLA,CLU44001BV1000826000001000000000^FS"));
        assert!(zpl.contains("^FDCLU44001^FS"));
        assert!(zpl.contains("^FDACME INDUSTRIAL^FS"));
        // Serial on the label is the code tail
        assert!(zpl.contains("^FD000000^FS"));
    }

    #[test]
    fn test_zpl_without_footer() {
        let r = record("C0DE");
        let zpl = LabelDispatcher::build_zpl(&r, &identity(), None);
        assert_eq!(zpl.matches("^FB591,1,0,C,0").count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_success_marks_printed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let store = MemoryStore::new();
        let r = stored_record(&store, "AAAABBBBCCCCDDDDEEEEFFFF00001111").await;
        let printer = PrinterConfig {
            host: "127.0.0.1".into(),
            port,
            timeout_ms: 1000,
            footer: None,
        };

        let state = LabelDispatcher::dispatch(Some(&printer), &store, &r, &identity()).await;
        assert_eq!(state, PrintState::Printed);

        let received = server.await.unwrap();
        let text = String::from_utf8(received).unwrap();
        assert!(text.contains("AAAABBBBCCCCDDDDEEEEFFFF00001111"));

        let stored = store.find_cycle_by_code(&r.code).await.unwrap().unwrap();
        assert_eq!(stored.print_state, PrintState::Printed);
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_print_failed() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let store = MemoryStore::new();
        let r = stored_record(&store, "AAAABBBBCCCCDDDDEEEEFFFF00002222").await;
        let printer = PrinterConfig {
            host: "127.0.0.1".into(),
            port,
            timeout_ms: 500,
            footer: None,
        };

        let state = LabelDispatcher::dispatch(Some(&printer), &store, &r, &identity()).await;
        assert_eq!(state, PrintState::PrintFailed);

        let stored = store.find_cycle_by_code(&r.code).await.unwrap().unwrap();
        assert_eq!(stored.print_state, PrintState::PrintFailed);
    }

    #[tokio::test]
    async fn test_dispatch_without_printer_is_noop() {
        let store = MemoryStore::new();
        let r = stored_record(&store, "AAAABBBBCCCCDDDDEEEEFFFF00003333").await;
        let state = LabelDispatcher::dispatch(None, &store, &r, &identity()).await;
        assert_eq!(state, PrintState::Unprinted);
    }
}
