//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests raft-storage crate against raft-core's Storage contract
//! what: persistence, crash recovery, atomic writes, edge cases, node restart

use raft_core::{ClusterConfig, Command, LogEntry, NodeState, RaftNode, RequestVoteRequest};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use std::fs;
use tempfile::tempdir;

fn entry(term: u64, index: u64, data: &[u8]) -> LogEntry {
    LogEntry::new(term, index, Command::new("put", data.to_vec()))
}

fn id(s: &str) -> String {
    s.to_string()
}

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory {
    use super::*;

    #[test]
    fn new_storage_has_default_values() {
        let state = InMemoryStorage::new().load_state().unwrap();

        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert!(state.log.is_empty());
    }

    #[test]
    fn overwrite_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(1, Some(&id("n1"))).unwrap();
        storage.save_term_and_vote(5, Some(&id("n3"))).unwrap();

        let state = storage.load_state().unwrap();
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for.as_deref(), Some("n3"));
    }

    #[test]
    fn append_in_batches() {
        let mut storage = InMemoryStorage::new();

        storage.append_entries(&[entry(1, 1, b"a")]).unwrap();
        storage.save_log_entry(&entry(1, 2, b"b")).unwrap();
        storage.append_entries(&[entry(1, 3, b"c")]).unwrap();
        storage.append_entries(&[]).unwrap();

        assert_eq!(storage.load_state().unwrap().log.len(), 3);
    }

    #[test]
    fn truncate_empty_log() {
        let mut storage = InMemoryStorage::new();
        storage.truncate_log_from(5).unwrap();
        assert!(storage.load_state().unwrap().log.is_empty());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft_data");

        FileStorage::new(&path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn save_creates_meta_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(&id("n2"))).unwrap();

        assert!(dir.path().join("meta.json").exists());
    }

    #[test]
    fn append_and_load_entries() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage
            .append_entries(&[entry(1, 1, b"k1=v1"), entry(1, 2, b"k2=v2")])
            .unwrap();

        let log = storage.load_state().unwrap().log;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].command.data, b"k1=v1".to_vec());
        assert!(dir.path().join("log.json").exists());
    }

    #[test]
    fn corrupt_meta_file_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("meta.json"), b"{ not json").unwrap();

        assert!(FileStorage::new(dir.path()).is_err());
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn multiple_restarts_preserve_state() {
        let dir = tempdir().unwrap();

        // session 1
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(1, Some(&id("n1"))).unwrap();
            storage.append_entries(&[entry(1, 1, b"a")]).unwrap();
        }

        // session 2
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(2, Some(&id("n2"))).unwrap();
            storage.append_entries(&[entry(2, 2, b"b")]).unwrap();
        }

        // session 3 - verify
        {
            let state = FileStorage::new(dir.path()).unwrap().load_state().unwrap();
            assert_eq!(state.current_term, 2);
            assert_eq!(state.voted_for.as_deref(), Some("n2"));
            assert_eq!(state.log.len(), 2);
        }
    }

    #[test]
    fn truncation_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .append_entries(&[entry(1, 1, b"a"), entry(1, 2, b"b"), entry(1, 3, b"c")])
                .unwrap();
            storage.truncate_log_from(2).unwrap();
            storage.append_entries(&[entry(2, 2, b"B")]).unwrap();
        }

        let log = FileStorage::new(dir.path()).unwrap().load_state().unwrap().log;
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 2);
        assert_eq!(log[1].command.data, b"B".to_vec());
    }

    #[test]
    fn clear_removes_all_files() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(&id("n3"))).unwrap();
        storage.append_entries(&[entry(1, 1, b"cmd")]).unwrap();
        storage.clear().unwrap();

        assert!(!dir.path().join("meta.json").exists());
        assert!(!dir.path().join("log.json").exists());
        let state = storage.load_state().unwrap();
        assert_eq!(state.current_term, 0);
        assert!(state.log.is_empty());
    }

    #[test]
    fn node_reloads_term_vote_and_log_after_restart() {
        let dir = tempdir().unwrap();
        let members = vec![id("n1"), id("n2"), id("n3")];

        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let mut node = RaftNode::new(ClusterConfig::new("n1", members.clone()), storage).unwrap();
            let req = RequestVoteRequest {
                term: 3,
                candidate_id: id("n2"),
                last_log_index: 0,
                last_log_term: 0,
            };
            let (resp, _) = node.handle_request_vote(&req).unwrap();
            assert!(resp.vote_granted);

            let append = raft_core::AppendEntriesRequest {
                term: 3,
                leader_id: id("n2"),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(3, 1, b"x"), entry(3, 2, b"y")],
                leader_commit: 1,
            };
            let (resp, _) = node.handle_append_entries(&append).unwrap();
            assert!(resp.success);
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        let mut node = RaftNode::new(ClusterConfig::new("n1", members), storage).unwrap();
        assert_eq!(node.state(), NodeState::Follower);
        assert_eq!(node.current_term(), 3);
        assert_eq!(node.voted_for().map(String::as_str), Some("n2"));
        assert_eq!(node.last_log_index(), 2);
        // commit index is volatile
        assert_eq!(node.commit_index(), 0);

        // the persisted vote still binds in term 3
        let rival = RequestVoteRequest {
            term: 3,
            candidate_id: id("n3"),
            last_log_index: 2,
            last_log_term: 3,
        };
        let (resp, _) = node.handle_request_vote(&rival).unwrap();
        assert!(!resp.vote_granted);
    }
}

// =============================================================================
// SECTION 4: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn files_are_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(&id("n2"))).unwrap();
        storage.append_entries(&[entry(1, 1, b"cmd")]).unwrap();

        for name in ["meta.json", "log.json"] {
            let contents = fs::read_to_string(dir.path().join(name)).unwrap();
            let _: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
        }
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(5, Some(&id("n2"))).unwrap();
        storage.append_entries(&[entry(1, 1, b"cmd")]).unwrap();
        storage.truncate_log_from(1).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}

// =============================================================================
// SECTION 5: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn binary_and_unicode_command_data() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        let binary = vec![0x00, 0xFF, 0x7F, 0x80, 0xFE];
        let unicode = "SET 键 值 🎉".as_bytes().to_vec();
        storage
            .append_entries(&[entry(1, 1, &binary), entry(1, 2, &unicode)])
            .unwrap();

        let log = FileStorage::new(dir.path()).unwrap().load_state().unwrap().log;
        assert_eq!(log[0].command.data, binary);
        assert_eq!(log[1].command.data, unicode);
    }

    #[test]
    fn very_high_term_number() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(u64::MAX, None).unwrap();
        assert_eq!(storage.load_state().unwrap().current_term, u64::MAX);
    }

    #[test]
    fn many_log_entries() {
        let mut storage = InMemoryStorage::new();
        let entries: Vec<LogEntry> = (1..=1000)
            .map(|i| entry(1, i, format!("cmd{}", i).as_bytes()))
            .collect();

        storage.append_entries(&entries).unwrap();
        assert_eq!(storage.load_state().unwrap().log.len(), 1000);
    }
}

// =============================================================================
// SECTION 6: STORAGE TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn exercise_storage<S: Storage>(storage: &mut S) {
        storage.save_term(5).unwrap();
        storage.save_voted_for(Some(&id("n2"))).unwrap();
        let state = storage.load_state().unwrap();
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for.as_deref(), Some("n2"));

        storage.append_entries(&[entry(1, 1, b"cmd")]).unwrap();
        assert_eq!(storage.load_state().unwrap().log.len(), 1);

        storage.truncate_log_from(1).unwrap();
        assert!(storage.load_state().unwrap().log.is_empty());

        storage.clear().unwrap();
        assert_eq!(storage.load_state().unwrap().current_term, 0);
    }

    #[test]
    fn in_memory_implements_trait() {
        exercise_storage(&mut InMemoryStorage::new());
    }

    #[test]
    fn file_storage_implements_trait() {
        let dir = tempdir().unwrap();
        exercise_storage(&mut FileStorage::new(dir.path()).unwrap());
    }

    #[test]
    fn boxed_storage_implements_trait() {
        let dir = tempdir().unwrap();
        let mut boxed: Box<dyn Storage> = Box::new(FileStorage::new(dir.path()).unwrap());
        exercise_storage(&mut boxed);
    }
}
