//! Integration tests for attachments bound to entities

use parking_lot::Mutex;
use potafloes::{Attachment, AttachmentKind, Context, Error, Index, Schema, Value, ValueType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn exam_schema(min: usize, max: usize) -> (Schema, potafloes::EntityType) {
    let schema = Schema::new("exams");
    let exam = schema
        .entity("Exam")
        .attribute("title", ValueType::Str)
        .bag("tags", ValueType::Str)
        .single("grader", ValueType::optional(ValueType::Str))
        .bounded("scores", ValueType::Int, min, max)
        .index(Index::attribute("by_title", "title"))
        .declare()
        .unwrap();
    (schema, exam)
}

#[test]
fn test_bag_delivers_each_element_once_per_subscriber() {
    let (_schema, exam) = exam_schema(0, 2);
    let ctx = Context::new("bags");
    let calls = Arc::new(AtomicUsize::new(0));
    let held = Arc::new(Mutex::new(None));

    let (seen, slot) = (calls.clone(), held.clone());
    ctx.run(move |ctx| async move {
        let final_exam = exam.create(&ctx).set("title", "final").build()?;
        let tags = final_exam.bag("tags")?;
        tags.send("hard")?;

        for _ in 0..2 {
            let seen = seen.clone();
            tags.subscribe(move |_| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })?;
        }

        assert!(!tags.send("hard")?);
        assert!(!tags.send(Value::None)?);
        assert!(tags.send("long")?);
        *slot.lock() = Some(tags);
        Ok(())
    })
    .unwrap();

    // two elements, two subscribers, one delivery each
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let tags = held.lock().clone().unwrap();
    assert_eq!(tags.len(), 2);
    assert!(tags.contains("hard"));
}

#[test]
fn test_single_await_and_exclusivity() {
    let (_schema, exam) = exam_schema(0, 2);
    let ctx = Context::new("singles");
    let awaited = Arc::new(Mutex::new(None));

    let slot = awaited.clone();
    ctx.run(move |ctx| async move {
        let final_exam = exam.create(&ctx).set("title", "final").build()?;
        let grader = final_exam.single("grader")?;
        assert_eq!(grader.value(), None);

        let waiting = grader.clone();
        ctx.spawn("wait_for_grader", async move {
            let value = waiting.await?;
            *slot.lock() = Some(value);
            Ok(())
        })?;
        tokio::task::yield_now().await;

        assert!(grader.send("ada")?);
        assert!(!grader.send("ada")?);
        let err = grader.send("grace").unwrap_err();
        assert_eq!(
            err,
            Error::DoubleSet {
                entity: "Exam[by_title=\"final\"]".to_string(),
                attribute: "grader".to_string(),
                existing: Value::str("ada"),
                attempted: Value::str("grace"),
            }
        );
        Ok(())
    })
    .unwrap();

    assert_eq!(*awaited.lock(), Some(Some(Value::str("ada"))));
}

#[test]
fn test_bounded_stream_completes_at_max() {
    let (_schema, exam) = exam_schema(0, 2);
    let ctx = Context::new("bounded");
    let collected = Arc::new(Mutex::new(None));
    let held = Arc::new(Mutex::new(None));

    let (slot, stream_slot) = (collected.clone(), held.clone());
    ctx.run(move |ctx| async move {
        let final_exam = exam.create(&ctx).set("title", "final").build()?;
        let scores = final_exam.bounded("scores")?;

        let waiting = scores.clone();
        ctx.spawn("collect_scores", async move {
            let items = waiting.await?;
            *slot.lock() = Some(items);
            Ok(())
        })?;

        scores.send(90)?;
        scores.send(Value::None)?;
        // duplicates are not counted, even after completion
        scores.send(90)?;
        *stream_slot.lock() = Some(scores);
        Ok(())
    })
    .unwrap();

    assert_eq!(*collected.lock(), Some(vec![Value::Int(90)]));
    let scores = held.lock().clone().unwrap();
    assert!(scores.is_complete());
    assert_eq!(
        scores.send(91).unwrap_err(),
        Error::BoundedStreamOverflow {
            attachment: "Exam[by_title=\"final\"].scores".to_string(),
            max: 2,
        }
    );
}

#[test]
fn test_incomplete_bounded_stream_fails_the_waiter() {
    let (_schema, exam) = exam_schema(2, 2);
    let ctx = Context::new("incomplete");

    let err = ctx
        .run(move |ctx| async move {
            let final_exam = exam.create(&ctx).set("title", "final").build()?;
            let scores = final_exam.bounded("scores")?;

            let waiting = scores.clone();
            ctx.spawn("collect_scores", async move {
                waiting.await?;
                Ok(())
            })?;
            tokio::task::yield_now().await;

            scores.send(1)?;
            let err = scores.send(Value::None).unwrap_err();
            assert!(matches!(err, Error::IncompleteBoundedStream { len: 1, min: 2, .. }));
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::IncompleteBoundedStream { len: 1, min: 2, .. })
    ));
    assert!(ctx.is_frozen());
}

#[test]
fn test_supplied_attachment_is_shared() {
    let (_schema, exam) = exam_schema(0, 2);
    let ctx = Context::new("supplied");
    let held = Arc::new(Mutex::new(None));

    let slot = held.clone();
    ctx.run(move |ctx| async move {
        let shared = Attachment::new(&ctx, "curriculum", "tags", AttachmentKind::Bag, ValueType::Str)?;
        shared.send("core")?;

        let first = exam
            .create(&ctx)
            .set("title", "first")
            .set("tags", &shared)
            .build()?;
        assert!(first.attachment("tags")?.same(&shared));

        // an existing instance mirrors a supplied attachment instead
        let mirror = Attachment::new(&ctx, "electives", "tags", AttachmentKind::Bag, ValueType::Str)?;
        mirror.send("optional")?;
        let again = exam
            .create(&ctx)
            .set("title", "first")
            .set("tags", &mirror)
            .build()?;
        assert_eq!(again, first);

        *slot.lock() = Some((first, mirror));
        Ok(())
    })
    .unwrap();

    let (first, mirror) = held.lock().clone().unwrap();
    let tags = first.bag("tags").unwrap();
    assert!(tags.contains("core") && tags.contains("optional"));
    assert!(mirror.contains("core") && mirror.contains("optional"));
}

#[test]
fn test_add_rejects_incompatible_inner_type() {
    let (_schema, exam) = exam_schema(0, 2);
    let ctx = Context::new("add");

    ctx.run(move |ctx| async move {
        let final_exam = exam.create(&ctx).set("title", "final").build()?;
        let tags = final_exam.bag("tags")?;
        let numbers = Attachment::new(&ctx, "numbers", "items", AttachmentKind::Bag, ValueType::Int)?;

        assert!(matches!(
            tags.add(&numbers),
            Err(Error::IncompatibleAttachment { .. })
        ));
        assert!(matches!(
            tags.send(3),
            Err(Error::AttachmentItemType { .. })
        ));
        Ok(())
    })
    .unwrap();
}
