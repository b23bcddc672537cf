use chrono::Utc;
use tracker::attachments::{assign_positional_owners, attachment_for_comment, description_attachment};
use tracker::models::{Attachment, AttachmentOwner, Comment, ParentType, UNKNOWN_USER};
use tracker::thread::{build_tree, ensure_comment_ids, flatten, submit_reply, thread_forest, ReplyTarget, ThreadError, ThreadView};

fn comment(text: &str, level: u32) -> Comment {
    Comment {
        id: None,
        text: text.into(),
        user: "tester".into(),
        timestamp: Utc::now(),
        level,
        parent_type: ParentType::Comment,
        parent_index: None,
        parent_id: None,
        is_reply: level > 0,
    }
}

fn file(name: &str) -> Attachment {
    Attachment { filename: name.into(), url: Some(format!("https://files.test/{name}")), path: None, owner: None }
}

fn reply(comments: &[Comment], target: ReplyTarget, text: &str) -> Vec<Comment> {
    submit_reply(comments, target, text, "tester", Utc::now()).unwrap().comments
}

fn top(comments: &[Comment], text: &str) -> Vec<Comment> {
    reply(comments, ReplyTarget::Comment { index: None }, text)
}

fn to(comments: &[Comment], index: usize, text: &str) -> Vec<Comment> {
    reply(comments, ReplyTarget::Comment { index: Some(index) }, text)
}

#[test]
fn rebuilt_tree_flattens_to_storage_order() {
    // a, b, replies to both, then nested replies and a reply that lands between siblings
    let mut c = top(&[], "a");
    c = top(&c, "b");
    c = to(&c, 0, "a.1");
    c = to(&c, 0, "a.2");
    c = to(&c, 1, "a.2.1");
    c = to(&c, 3, "a.1.1");
    let b = c.iter().position(|x| x.text == "b").unwrap();
    c = to(&c, b, "b.1");
    c = top(&c, "c");

    let expected: Vec<usize> = (0..c.len()).collect();
    assert_eq!(flatten(&build_tree(&c)), expected);
    assert_eq!(flatten(&thread_forest(c.iter().enumerate())), expected);
}

#[test]
fn reply_is_spliced_after_target_and_later_entries_keep_recorded_fields() {
    let mut c = top(&[], "root");
    c = to(&c, 0, "first reply");
    c = top(&c, "second root");
    let before = c.clone();

    let out = submit_reply(&c, ReplyTarget::Comment { index: Some(0) }, "newest reply", "tester", Utc::now()).unwrap();
    assert_eq!(out.position, 1);
    assert_eq!(out.comments.len(), before.len() + 1);
    assert_eq!(out.reply().text, "newest reply");
    assert_eq!(out.reply().parent_index, Some(0));

    // everything after the insertion point shifted by one, untouched otherwise
    for (i, old) in before.iter().enumerate().skip(1) {
        let moved = &out.comments[i + 1];
        assert_eq!(moved.text, old.text);
        assert_eq!(moved.level, old.level);
        assert_eq!(moved.parent_index, old.parent_index);
    }
    // input is not mutated
    assert_eq!(c, before);
}

#[test]
fn reply_to_description_reply_is_a_comment() {
    let c = reply(&[], ReplyTarget::Description { index: None }, "on the description");
    assert_eq!(c[0].parent_type, ParentType::Description);
    assert!(c[0].is_reply);
    assert_eq!(c[0].level, 0);

    let c = to(&c, 0, "nested");
    assert_eq!(c[1].parent_type, ParentType::Comment);
    assert_eq!(c[1].level, 1);
    assert_eq!(c[1].parent_id, c[0].id);
}

#[test]
fn positional_attachments_pair_with_following_comment() {
    let comments: Vec<Comment> = (0..4).map(|i| comment(&format!("c{i}"), 0)).collect();
    let files: Vec<Attachment> = (0..=4).map(|i| file(&format!("f{i}.png"))).collect();

    assert_eq!(description_attachment(&files), Some(&files[0]));
    for k in 0..comments.len() {
        assert_eq!(attachment_for_comment(&files, &comments, k), Some(&files[k + 1]));
    }
}

#[test]
fn owner_migration_preserves_positional_pairing() {
    let mut comments: Vec<Comment> = (0..3).map(|i| comment(&format!("c{i}"), 0)).collect();
    let mut files: Vec<Attachment> = (0..=3).map(|i| file(&format!("f{i}.png"))).collect();
    files.push(file("extra.png"));

    assert_eq!(ensure_comment_ids(&mut comments), 3);
    assert_eq!(assign_positional_owners(&comments, &mut files), 4);
    assert_eq!(files[0].owner, Some(AttachmentOwner::Description));
    assert_eq!(files[4].owner, None);
    for k in 0..comments.len() {
        assert_eq!(attachment_for_comment(&files, &comments, k).map(|f| f.filename.as_str()), Some(format!("f{}.png", k + 1).as_str()));
    }

    // a new comment spliced in front no longer steals the neighbour's file
    let spliced = to(&comments, 0, "reply");
    assert_eq!(attachment_for_comment(&files, &spliced, 2).map(|f| f.filename.as_str()), Some("f2.png"));
    assert_eq!(attachment_for_comment(&files, &spliced, 1), None);
}

#[test]
fn single_reply_example() {
    let c = vec![comment("root", 0)];
    let c = to(&c, 0, "child");
    assert_eq!(c.len(), 2);
    assert_eq!(c[0].level, 0);
    assert_eq!(c[1].level, 1);
    assert_eq!(c[1].parent_index, Some(0));
    assert_eq!(c[1].parent_type, ParentType::Comment);

    let forest = build_tree(&c);
    assert_eq!(forest.len(), 1);
    assert_eq!(forest[0].children.len(), 1);
    assert_eq!(forest[0].children[0].original_index, 1);
}

#[test]
fn empty_and_whitespace_text_is_rejected() {
    let err = submit_reply(&[], ReplyTarget::Comment { index: None }, "   \n", "tester", Utc::now()).unwrap_err();
    assert_eq!(err, ThreadError::EmptyText);
}

#[test]
fn blank_author_becomes_unknown_user_and_text_is_trimmed() {
    let out = submit_reply(&[], ReplyTarget::Comment { index: None }, "  hi  ", " ", Utc::now()).unwrap();
    assert_eq!(out.reply().user, UNKNOWN_USER);
    assert_eq!(out.reply().text, "hi");
    assert!(!out.reply().is_reply);
}

#[test]
fn out_of_range_target_appends_at_top_level() {
    let c = top(&[], "only");
    let out = submit_reply(&c, ReplyTarget::Comment { index: Some(7) }, "lost", "tester", Utc::now()).unwrap();
    assert_eq!(out.position, 1);
    assert_eq!(out.reply().level, 0);
    assert_eq!(out.reply().parent_index, None);
    assert!(out.reply().is_reply);
}

#[test]
fn section_views_split_and_order_entries() {
    let mut c = top(&[], "first");
    c = reply(&c, ReplyTarget::Description { index: None }, "desc one");
    c = top(&c, "second");
    c = to(&c, 0, "first.1");
    c = reply(&c, ReplyTarget::Description { index: None }, "desc two");

    let view = ThreadView::build(&c, &[]);
    let roots: Vec<&str> = view.comments.iter().map(|n| n.comment.text.as_str()).collect();
    assert_eq!(roots, vec!["second", "first"]);
    let first = &view.comments[1];
    assert_eq!(first.children.len(), 1);
    assert_eq!(first.children[0].comment.text, "first.1");

    let desc: Vec<&str> = view.description_replies.iter().map(|d| d.comment.text.as_str()).collect();
    assert_eq!(desc, vec!["desc two", "desc one"]);
    assert_eq!(view.description_replies[1].original_index, 2);
}

#[test]
fn indexed_description_reply_nests_under_its_parent() {
    let mut c = reply(&[], ReplyTarget::Description { index: None }, "desc one");
    c = top(&c, "comment");
    let out = submit_reply(&c, ReplyTarget::Description { index: Some(0) }, "follow-up", "tester", Utc::now()).unwrap();
    assert_eq!(out.position, 1);
    let r = out.reply();
    assert_eq!(r.parent_type, ParentType::Description);
    assert_eq!(r.level, c[0].level + 1);
    assert_eq!(r.parent_index, Some(0));
    assert_eq!(r.parent_id, c[0].id);
    assert!(r.is_reply);
    assert_eq!(out.comments[2].text, "comment");

    // description replies render flat, newest first, and never in the comment tree
    let view = ThreadView::build(&out.comments, &[]);
    let desc: Vec<(&str, usize)> = view
        .description_replies
        .iter()
        .map(|d| (d.comment.text.as_str(), d.original_index))
        .collect();
    assert_eq!(desc, vec![("follow-up", 1), ("desc one", 0)]);
    assert_eq!(view.comments.len(), 1);
    assert_eq!(view.comments[0].comment.text, "comment");
}

#[test]
fn out_of_range_description_target_appends_at_top_level() {
    let c = top(&[], "only");
    let out = submit_reply(&c, ReplyTarget::Description { index: Some(5) }, "lost", "tester", Utc::now()).unwrap();
    assert_eq!(out.position, 1);
    assert_eq!(out.reply().level, 0);
    assert_eq!(out.reply().parent_type, ParentType::Description);
    assert_eq!(out.reply().parent_index, None);
    assert!(out.reply().is_reply);

    let view = ThreadView::build(&out.comments, &[]);
    assert_eq!(view.description_replies.len(), 1);
    assert_eq!(view.description_replies[0].comment.text, "lost");
}
