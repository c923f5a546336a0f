fn main() {
    println!("Run `cargo test -p assembly-race` to execute the concurrent assembly scenarios.");
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use chunkmerge::{
        AssemblyConfig, AssemblyCoordinator, AssemblyOutcome, AssemblyRequest, ChunkNumbering,
        ChunkStore, Expected, FinalNamer, LocalChunkStore, LogicalFileId, ReceivedChunk,
        SaveStrategy, UploadSession, chunk_artifact_name,
    };
    use proptest::prelude::*;
    use tempfile::TempDir;

    struct Env {
        dir: TempDir,
        store: Arc<LocalChunkStore>,
        coordinator: AssemblyCoordinator<LocalChunkStore>,
    }

    fn env(numbering: ChunkNumbering) -> Env {
        let dir = TempDir::new().unwrap();
        let mut config = AssemblyConfig::with_chunk_dir(dir.path().join("chunks"));
        config.numbering = numbering;
        config.buffer_size = 4096;
        let store = Arc::new(LocalChunkStore::new(&config.chunk_dir).unwrap());
        let coordinator = AssemblyCoordinator::new(Arc::clone(&store), config);
        Env {
            dir,
            store,
            coordinator,
        }
    }

    impl Env {
        fn out_dir(&self) -> PathBuf {
            self.dir.path().join("assembled")
        }

        fn destination(&self, id: &LogicalFileId) -> PathBuf {
            self.out_dir().join(format!("{id}.bin"))
        }

        fn session(&self, strategy: SaveStrategy) -> UploadSession<LocalChunkStore> {
            let out = self.out_dir();
            let namer: FinalNamer =
                Box::new(move |id: &LogicalFileId| out.join(format!("{id}.bin")));
            UploadSession::new(self.coordinator.clone(), strategy, namer)
        }

        fn artifacts_of(&self, id: &LogicalFileId) -> usize {
            self.coordinator.list_chunks(id).unwrap().len()
        }

        fn all_blobs(&self) -> Vec<String> {
            self.store.list(&|_: &str| true).unwrap()
        }
    }

    fn id(s: &str) -> LogicalFileId {
        LogicalFileId::new(s).unwrap()
    }

    /// Distinct, variable-length content for chunk `i`.
    fn chunk_data(i: u64) -> Vec<u8> {
        let mut data = format!("<{i}>").into_bytes();
        data.extend(std::iter::repeat_n(b'a' + (i % 26) as u8, (i as usize * 37) % 5000));
        data
    }

    fn expected_content(indices: impl Iterator<Item = u64>) -> Vec<u8> {
        indices.flat_map(chunk_data).collect()
    }

    fn read(path: &Path) -> Vec<u8> {
        std::fs::read(path).unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
    }

    // --- Example and ordering ---

    #[test]
    fn example_upload42() {
        let env = env(ChunkNumbering::ZeroBased);
        let up = id("upload42");
        env.store.put("upload42.0.part", b"AAA").unwrap();
        env.store.put("upload42.1.part", b"BB").unwrap();
        env.store.put("upload42.2.part", b"C").unwrap();

        let request = AssemblyRequest {
            logical_id: up.clone(),
            expected: Expected::Total(3),
            destination: env.destination(&up),
        };
        let outcome = env.coordinator.try_assemble(&request).unwrap();
        let file = outcome.assembled().unwrap();

        assert_eq!(read(&file.path), b"AAABBC");
        assert_eq!(file.size, 6);
        assert!(env.all_blobs().is_empty());
    }

    #[test]
    fn natural_order_one_through_eleven() {
        let env = env(ChunkNumbering::OneBased);
        let session = env.session(SaveStrategy::Parallel);
        let up = id("natural");

        for i in [10u64, 2, 11, 1, 3, 9, 4, 8, 5, 7, 6] {
            session
                .receive(ReceivedChunk::new(up.clone(), i, chunk_data(i)).with_total(11))
                .unwrap();
        }

        assert_eq!(read(&env.destination(&up)), expected_content(1..=11));
        assert_eq!(env.artifacts_of(&up), 0);
    }

    // --- Concurrency ---

    #[test]
    fn concurrent_parallel_receipts_assemble_once() {
        const CHUNKS: u64 = 32;
        let env = env(ChunkNumbering::ZeroBased);
        let session = Arc::new(env.session(SaveStrategy::Parallel));
        let up = id("parallel-upload");
        let barrier = Arc::new(Barrier::new(CHUNKS as usize));

        let handles: Vec<_> = (0..CHUNKS)
            .rev()
            .map(|i| {
                let session = Arc::clone(&session);
                let barrier = Arc::clone(&barrier);
                let up = up.clone();
                thread::spawn(move || {
                    barrier.wait();
                    session.receive(ReceivedChunk::new(up, i, chunk_data(i)).with_total(CHUNKS))
                })
            })
            .collect();

        let receipts: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().expect("receipt must not fail"))
            .collect();

        let assembled = receipts
            .iter()
            .filter(|r| r.outcome.as_ref().is_some_and(AssemblyOutcome::is_assembled))
            .count();
        assert!(assembled <= 1, "at most one receipt may assemble, got {assembled}");

        // Every receipt saw the set before the last chunk landed, or raced
        // with the winner; either way a final check settles it.
        if assembled == 0 {
            let outcome = session
                .coordinator()
                .try_assemble(&AssemblyRequest {
                    logical_id: up.clone(),
                    expected: Expected::Total(CHUNKS),
                    destination: env.destination(&up),
                })
                .unwrap();
            assert!(matches!(
                outcome,
                AssemblyOutcome::Assembled(_) | AssemblyOutcome::AlreadyHandled { .. }
            ));
        }

        assert_eq!(read(&env.destination(&up)), expected_content(0..CHUNKS));
        assert_eq!(env.artifacts_of(&up), 0);
    }

    #[test]
    fn concurrent_try_assemble_rounds() {
        const RUNNERS: usize = 6;
        let env = env(ChunkNumbering::ZeroBased);

        for round in 0..10u64 {
            let up = id(&format!("round-{round}"));
            let total = 3 + round;
            for i in 0..total {
                env.store
                    .put(&chunk_artifact_name(&up, i, "part"), &chunk_data(i))
                    .unwrap();
            }

            let request = AssemblyRequest {
                logical_id: up.clone(),
                expected: Expected::Total(total),
                destination: env.destination(&up),
            };
            let barrier = Arc::new(Barrier::new(RUNNERS));
            let handles: Vec<_> = (0..RUNNERS)
                .map(|_| {
                    let coordinator = env.coordinator.clone();
                    let request = request.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        coordinator.try_assemble(&request)
                    })
                })
                .collect();

            let outcomes: Vec<_> = handles
                .into_iter()
                .map(|h| h.join().unwrap().expect("losing runners must not fail"))
                .collect();

            let winners = outcomes.iter().filter(|o| o.is_assembled()).count();
            assert_eq!(winners, 1, "round {round}: {outcomes:?}");
            assert_eq!(read(&request.destination), expected_content(0..total));
            assert_eq!(env.artifacts_of(&up), 0);
        }

        // No claim markers or temporaries left behind.
        assert!(env.all_blobs().is_empty(), "{:?}", env.all_blobs());
    }

    #[test]
    fn interleaved_uploads_with_prefix_ids() {
        let env = env(ChunkNumbering::ZeroBased);
        let session = Arc::new(env.session(SaveStrategy::Parallel));
        let ids = [id("report"), id("report.1"), id("report.1.2")];

        let handles: Vec<_> = ids
            .iter()
            .flat_map(|up| (0..12u64).map(move |i| (up.clone(), i)))
            .map(|(up, i)| {
                let session = Arc::clone(&session);
                thread::spawn(move || {
                    session
                        .receive(ReceivedChunk::new(up, i, chunk_data(i)).with_total(12))
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for up in &ids {
            // Settle any set whose last receipt lost the race.
            let settled = session
                .coordinator()
                .try_assemble(&AssemblyRequest {
                    logical_id: up.clone(),
                    expected: Expected::Total(12),
                    destination: env.destination(up),
                })
                .unwrap();
            assert!(
                matches!(
                    settled,
                    AssemblyOutcome::Assembled(_) | AssemblyOutcome::AlreadyHandled { .. }
                ),
                "{up}: {settled:?}"
            );
            assert_eq!(read(&env.destination(up)), expected_content(0..12), "{up}");
            assert_eq!(env.artifacts_of(up), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn async_runners_agree_on_one_winner() {
        let env = env(ChunkNumbering::ZeroBased);
        let up = id("async-race");
        for i in 0..16u64 {
            env.store
                .put(&chunk_artifact_name(&up, i, "part"), &chunk_data(i))
                .unwrap();
        }

        let request = AssemblyRequest {
            logical_id: up.clone(),
            expected: Expected::Total(16),
            destination: env.destination(&up),
        };
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = env.coordinator.clone();
                let request = request.clone();
                tokio::spawn(async move { coordinator.try_assemble_async(request).await })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            if outcome.is_assembled() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(read(&request.destination), expected_content(0..16));
    }

    // --- Failure and retry ---

    #[test]
    fn early_check_leaves_chunks_untouched() {
        let env = env(ChunkNumbering::ZeroBased);
        let up = id("early");
        for i in [0u64, 1, 3] {
            env.store
                .put(&chunk_artifact_name(&up, i, "part"), &chunk_data(i))
                .unwrap();
        }
        let before: Vec<_> = env
            .coordinator
            .list_chunks(&up)
            .unwrap()
            .artifacts()
            .iter()
            .map(|a| read(&a.path))
            .collect();

        let outcome = env
            .coordinator
            .try_assemble(&AssemblyRequest {
                logical_id: up.clone(),
                expected: Expected::Total(4),
                destination: env.destination(&up),
            })
            .unwrap();
        assert!(outcome.is_incomplete());

        let after: Vec<_> = env
            .coordinator
            .list_chunks(&up)
            .unwrap()
            .artifacts()
            .iter()
            .map(|a| read(&a.path))
            .collect();
        assert_eq!(before, after);
        assert!(!env.destination(&up).exists());
    }

    // --- Properties ---

    fn shuffled_indices() -> impl Strategy<Value = (Vec<u64>, usize)> {
        (1u64..24).prop_flat_map(|n| {
            (
                Just((0..n).collect::<Vec<u64>>()).prop_shuffle(),
                1usize..5,
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Any arrival order and any number of concurrent writers yields the
        /// chunks concatenated in index order.
        #[test]
        fn prop_any_arrival_order_assembles_in_index_order(
            (order, writers) in shuffled_indices()
        ) {
            let env = env(ChunkNumbering::ZeroBased);
            let up = id("prop");
            let total = order.len() as u64;
            let order = Arc::new(order);

            let handles: Vec<_> = (0..writers)
                .map(|w| {
                    let store = Arc::clone(&env.store);
                    let order = Arc::clone(&order);
                    let up = up.clone();
                    thread::spawn(move || {
                        for i in order.iter().skip(w).step_by(writers) {
                            store
                                .put(&chunk_artifact_name(&up, *i, "part"), &chunk_data(*i))
                                .unwrap();
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            let request = AssemblyRequest {
                logical_id: up.clone(),
                expected: Expected::Total(total),
                destination: env.destination(&up),
            };
            let outcome = env.coordinator.try_assemble(&request).unwrap();
            prop_assert!(outcome.is_assembled());
            prop_assert_eq!(read(&request.destination), expected_content(0..total));
            prop_assert_eq!(env.artifacts_of(&up), 0);
        }
    }
}
