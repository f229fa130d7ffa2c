#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use autosubsync::batch::{BatchChannelObserver, BatchCoordinator, BatchEvent, FailedItem, NullBatchObserver};
use autosubsync::job::{JobRequest, JobState};

use common::{sh_tool, Workspace};

fn episodes(ws: &Workspace, count: usize, tool: &str) -> Vec<JobRequest> {
    (1..=count)
        .map(|n| {
            let video = ws.file(&format!("ep{:02}.mkv", n), "video");
            let subtitle = ws.file(&format!("ep{:02}.srt", n), "1\n");
            JobRequest::new(video, subtitle, tool)
        })
        .collect()
}

#[tokio::test]
async fn one_failing_item_is_reported_and_the_rest_succeed() {
    let ws = Workspace::new(vec![sh_tool("broken", "exit 1")]);
    let mut requests = episodes(&ws, 4, "copy");
    requests[2].tool_name = "broken".to_string();
    let expected = FailedItem {
        index: 2,
        reference: requests[2].reference_path.clone(),
        subtitle: requests[2].subtitle_path.clone(),
        error: None,
    };

    let summary = BatchCoordinator::new(ws.context())
        .run(requests, &NullBatchObserver, &CancellationToken::new())
        .await;

    assert_eq!(summary.total, 4);
    assert_eq!(summary.success_count, 3);
    assert_eq!(summary.fail_count, 1);
    assert_eq!(summary.failed_items.len(), 1);
    let failed = &summary.failed_items[0];
    assert_eq!(
        (failed.index, &failed.reference, &failed.subtitle),
        (expected.index, &expected.reference, &expected.subtitle)
    );
    assert!(failed.error.is_some());
    assert!(!summary.cancelled);
    for n in [1, 2, 4] {
        assert!(ws.exists(&format!("ep{:02}.synced.srt", n)));
    }
    assert!(!ws.exists("ep03.synced.srt"));
}

#[tokio::test]
async fn items_run_strictly_one_after_another() {
    // each run appends start/end markers; overlapping runs would interleave them
    let ws = Workspace::new(vec![sh_tool(
        "logged",
        r#"log="$(dirname "$2")/order.log"; echo "start $2" >> "$log"; sleep 0.2; echo "end $2" >> "$log"; cp "$2" "$3""#,
    )]);
    let requests = episodes(&ws, 3, "logged");

    let summary = BatchCoordinator::new(ws.context())
        .run(requests, &NullBatchObserver, &CancellationToken::new())
        .await;
    assert_eq!(summary.success_count, 3);

    let log = std::fs::read_to_string(ws.path("order.log")).unwrap();
    let kinds: Vec<&str> = log.lines().map(|l| l.split(' ').next().unwrap()).collect();
    assert_eq!(kinds, vec!["start", "end", "start", "end", "start", "end"]);
}

#[tokio::test]
async fn blended_progress_never_decreases_and_ends_at_100() {
    let ws = Workspace::new(Vec::new());
    let requests = episodes(&ws, 3, "copy");
    let (observer, mut rx) = BatchChannelObserver::new();

    let summary = BatchCoordinator::new(ws.context())
        .run(requests, &observer, &CancellationToken::new())
        .await;
    assert_eq!(summary.success_count, 3);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let mut finished_items = 0;
    let mut last = 0u8;
    let mut seen = Vec::new();
    for event in &events {
        match event {
            BatchEvent::ItemFinished { .. } => finished_items += 1,
            BatchEvent::Progress(p) => {
                assert!(*p >= last, "progress went from {} to {}", last, p);
                if *p == 100 {
                    assert_eq!(finished_items, 3, "100 reported before the last item finished");
                }
                last = *p;
                seen.push(*p);
            }
            _ => {}
        }
    }
    assert_eq!(last, 100);
    assert_eq!(seen.iter().filter(|p| **p == 100).count(), 1);
    // per-item percentages are blended, not reset: 25% of item 2 is 33 + 8
    assert!(seen.contains(&41));
    assert!(matches!(events.last(), Some(BatchEvent::Finished(_))));
}

#[tokio::test]
async fn cancelling_stops_the_active_item_and_skips_the_rest() {
    let ws = Workspace::new(vec![sh_tool("slow", r#"echo 'step 5%'; sleep 30; cp "$2" "$3""#)]);
    let mut requests = episodes(&ws, 3, "slow");
    requests[0].tool_name = "copy".to_string();
    let (observer, mut rx) = BatchChannelObserver::new();

    let handle = BatchCoordinator::new(ws.context()).spawn(requests, Arc::new(observer));
    while let Some(event) = rx.recv().await {
        if matches!(event, BatchEvent::ItemProgress { index: 1, .. }) {
            break;
        }
    }
    handle.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(15), handle.join())
        .await
        .expect("batch must stop promptly")
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.fail_count, 0);
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.results[1].state, JobState::Cancelled);
    assert_eq!(summary.skipped(), 1);
    assert!(ws.exists("ep01.synced.srt"));
    assert!(!ws.exists("ep02.synced.srt"));
    assert!(!ws.exists("ep03.synced.srt"));
}
