use crate::ids::TransactionId;
use crate::messages::ParticipantsVotesMessage;
use crate::storage::{PaymentRecord, StorageError, StorageHandler, StorageOp};
use crate::transactions::PaymentTransaction;
use crate::trust_lines::TrustLine;
use log::*;
use ron::ser::PrettyConfig;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

const TRANSACTIONS: &str = "transactions";
const VOTES: &str = "votes";
const HISTORY: &str = "history";
const TRUST_LINES: &str = "trust_lines";

/// A file-based store.
///
/// Every record lives in its own RON file, e.g. `transactions/0a1b...ff.ron` or `trust_lines/<contractor>.ron`.
/// A batch is serialized completely before the first file is touched, so a serialization failure writes nothing.
pub struct FileStore {
    path: PathBuf,
    history_seq: u64,
}

impl FileStore {
    /// Creates a new file store rooted at `path`, creating the directory layout if needed.
    pub fn new(path: PathBuf) -> Result<Self, std::io::Error> {
        for dir in [TRANSACTIONS, VOTES, HISTORY, TRUST_LINES] {
            let sub = path.join(dir);
            if !sub.exists() {
                fs::create_dir_all(&sub)?;
            }
        }
        let history_seq = fs::read_dir(path.join(HISTORY))?.count() as u64;
        Ok(Self { path, history_seq })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn record_path(&self, dir: &str, name: &str) -> PathBuf {
        self.path.join(dir).join(format!("{name}.ron"))
    }

    fn load_dir<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>, StorageError> {
        let mut files = fs::read_dir(self.path.join(dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "ron"))
            .collect::<Vec<_>>();
        files.sort();
        files.iter().map(|p| read_record(p)).collect()
    }
}

fn to_ron<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    let config = PrettyConfig::new().compact_arrays(true).compact_maps(true);
    Ok(ron::ser::to_string_pretty(value, config)?)
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let val = fs::read_to_string(path)?;
    Ok(ron::de::from_str(&val)?)
}

impl StorageHandler for FileStore {
    fn apply(&mut self, ops: Vec<StorageOp>) -> Result<(), StorageError> {
        // (file, new contents); None deletes the file
        let mut writes: Vec<(PathBuf, Option<String>)> = Vec::with_capacity(ops.len());
        let mut seq = self.history_seq;
        for op in ops {
            let write = match op {
                StorageOp::SaveTransaction(tx) => {
                    (self.record_path(TRANSACTIONS, &tx.id().to_string()), Some(to_ron(tx.as_ref())?))
                }
                StorageOp::DeleteTransaction(id) => (self.record_path(TRANSACTIONS, &id.to_string()), None),
                StorageOp::SaveVotes(id, votes) => (self.record_path(VOTES, &id.to_string()), Some(to_ron(&votes)?)),
                StorageOp::SavePaymentRecord(record) => {
                    seq += 1;
                    let name = format!("{seq:010}-{}", record.transaction_id);
                    (self.record_path(HISTORY, &name), Some(to_ron(&record)?))
                }
                StorageOp::SaveTrustLine(line) => {
                    (self.record_path(TRUST_LINES, &line.contractor().to_string()), Some(to_ron(&line)?))
                }
            };
            writes.push(write);
        }
        for (path, contents) in writes {
            match contents {
                Some(val) => fs::write(&path, val)?,
                None => {
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }
        self.history_seq = seq;
        trace!("File store at {} updated", self.path.display());
        Ok(())
    }

    fn load_transactions(&self) -> Result<Vec<PaymentTransaction>, StorageError> {
        self.load_dir(TRANSACTIONS)
    }

    fn load_votes(&self, transaction_id: &TransactionId) -> Result<Option<ParticipantsVotesMessage>, StorageError> {
        let path = self.record_path(VOTES, &transaction_id.to_string());
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    fn load_trust_lines(&self) -> Result<Vec<TrustLine>, StorageError> {
        self.load_dir(TRUST_LINES)
    }

    fn payment_history(&self) -> Result<Vec<PaymentRecord>, StorageError> {
        self.load_dir(HISTORY)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::amount::{TrustLineAmount, TrustLineBalance};
    use crate::ids::NodeId;
    use crate::storage::{IOTransaction, PaymentDirection};

    #[test]
    fn records_survive_a_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bob = NodeId::from_name("bob");
        let tx = TransactionId::from_counter(7);
        {
            let mut store = FileStore::new(dir.path().to_path_buf()).expect("store to open");
            let mut io = IOTransaction::begin(&mut store);
            io.save_trust_line(&TrustLine::active(
                bob,
                TrustLineAmount::new(10),
                TrustLineAmount::new(20),
                TrustLineBalance::new(-3),
            ));
            io.save_payment_record(PaymentRecord::new(tx, PaymentDirection::Outgoing, bob, TrustLineAmount::new(3)));
            let mut votes = ParticipantsVotesMessage::new(NodeId::from_name("alice"));
            votes.add_participant(bob);
            io.save_votes(tx, &votes);
            io.commit().expect("commit");
        }
        let store = FileStore::new(dir.path().to_path_buf()).expect("store to reopen");
        let lines = store.load_trust_lines().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].balance().value(), -3);
        let history = store.payment_history().unwrap();
        assert_eq!(history[0].transaction_id, tx);
        assert_eq!(history[0].amount.value(), 3);
        assert!(store.load_votes(&tx).unwrap().is_some());
        assert!(store.load_votes(&TransactionId::from_counter(8)).unwrap().is_none());
    }

    #[test]
    fn history_keeps_insertion_order_across_reopens() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bob = NodeId::from_name("bob");
        for n in 0..3u64 {
            let mut store = FileStore::new(dir.path().to_path_buf()).expect("store to open");
            let mut io = IOTransaction::begin(&mut store);
            let id = TransactionId::from_counter(10 - n);
            io.save_payment_record(PaymentRecord::new(id, PaymentDirection::Incoming, bob, TrustLineAmount::new(1)));
            io.commit().unwrap();
        }
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        let ids = store.payment_history().unwrap().into_iter().map(|r| r.transaction_id).collect::<Vec<_>>();
        let expected = [10, 9, 8].map(TransactionId::from_counter);
        assert_eq!(ids, expected.to_vec());
    }
}
