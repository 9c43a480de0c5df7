use remedy_host::url::{build_url, parse_url, Provider, ResourceKind, ResourceRef};

fn all_refs() -> Vec<ResourceRef> {
    let mut refs = Vec::new();
    for provider in [Provider::GitHub, Provider::GitLab] {
        for kind in [ResourceKind::Issue, ResourceKind::Proposal] {
            for (owner, repo, number) in [
                ("acme", "app", 1),
                ("Acme", "App", 42),
                ("rust-lang", "cargo", 9_999),
                ("a", "b.c", 7),
            ] {
                refs.push(ResourceRef {
                    provider,
                    owner: owner.into(),
                    repo: repo.into(),
                    number,
                    kind,
                });
            }
        }
    }
    refs
}

#[test]
fn url_round_trip() {
    for r in all_refs() {
        let url = build_url(&r);
        let parsed = parse_url(&url).unwrap_or_else(|e| panic!("parse {url}: {e}"));
        assert_eq!(parsed, r, "round trip failed for {url}");
    }
}

#[test]
fn parses_known_shapes() {
    let r = parse_url("https://github.com/acme/app/issues/42").unwrap();
    assert_eq!(r.provider, Provider::GitHub);
    assert_eq!(r.kind, ResourceKind::Issue);
    assert_eq!(r.project(), "acme/app");
    assert_eq!(r.number, 42);

    let r = parse_url("https://github.com/acme/app/pull/7/").unwrap();
    assert_eq!(r.kind, ResourceKind::Proposal);

    let r = parse_url("https://gitlab.com/acme/app/-/merge_requests/3").unwrap();
    assert_eq!(r.provider, Provider::GitLab);
    assert_eq!(r.kind, ResourceKind::Proposal);

    // GitLab also serves the shorter legacy path.
    let r = parse_url("https://gitlab.com/acme/app/issues/3").unwrap();
    assert_eq!(r.kind, ResourceKind::Issue);
}

#[test]
fn case_is_preserved() {
    let r = parse_url("https://github.com/Acme/App/issues/1").unwrap();
    assert_eq!(r.project(), "Acme/App");
}

#[test]
fn rejects_malformed() {
    for url in [
        "",
        "not a url",
        "https://github.com/acme",
        "https://github.com/acme/app",
        "https://github.com/acme/app/issues/",
        "https://github.com/acme/app/issues/zero",
        "https://github.com/acme/app/issues/0",
        "https://github.com/acme/app/issues/-3",
        "https://example.com/acme/app/issues/5",
        "ftp://github.com/acme/app/issues/5",
    ] {
        assert!(parse_url(url).is_err(), "should reject {url:?}");
    }
}
