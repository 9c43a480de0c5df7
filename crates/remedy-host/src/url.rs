use anyhow::Result;
use remedy_core::Error;

/// Hosting providers with distinct URL grammars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    GitHub,
    GitLab,
}

impl Provider {
    pub fn domain(self) -> &'static str {
        match self {
            Self::GitHub => "github.com",
            Self::GitLab => "gitlab.com",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Issue,
    Proposal,
}

/// A parsed issue or proposal URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub provider: Provider,
    pub owner: String,
    pub repo: String,
    pub number: i64,
    pub kind: ResourceKind,
}

impl ResourceRef {
    pub fn project(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Canonical URL for a resource; `parse_url(build_url(r)) == r`.
pub fn build_url(r: &ResourceRef) -> String {
    let segment = match (r.provider, r.kind) {
        (Provider::GitHub, ResourceKind::Issue) => "issues",
        (Provider::GitHub, ResourceKind::Proposal) => "pull",
        (Provider::GitLab, ResourceKind::Issue) => "-/issues",
        (Provider::GitLab, ResourceKind::Proposal) => "-/merge_requests",
    };
    format!(
        "https://{}/{}/{}/{segment}/{}",
        r.provider.domain(),
        r.owner,
        r.repo,
        r.number
    )
}

fn bad(url: &str) -> anyhow::Error {
    anyhow::Error::new(Error::Configuration(format!("unrecognised issue/proposal URL: {url}")))
}

/// Parse a canonical issue or proposal URL.
pub fn parse_url(url: &str) -> Result<ResourceRef> {
    let trimmed = url
        .trim()
        .trim_end_matches('/')
        .strip_prefix("https://")
        .or_else(|| url.trim().trim_end_matches('/').strip_prefix("http://"))
        .ok_or_else(|| bad(url))?;

    let mut parts = trimmed.split('/');
    let domain = parts.next().ok_or_else(|| bad(url))?;
    let provider = match domain {
        "github.com" | "www.github.com" => Provider::GitHub,
        "gitlab.com" | "www.gitlab.com" => Provider::GitLab,
        _ => return Err(bad(url)),
    };
    let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| bad(url))?;
    let repo = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| bad(url))?;

    let rest: Vec<&str> = parts.collect();
    let (kind, number_str) = match (provider, rest.as_slice()) {
        (Provider::GitHub, ["issues", n]) => (ResourceKind::Issue, *n),
        (Provider::GitHub, ["pull", n]) => (ResourceKind::Proposal, *n),
        (Provider::GitLab, ["-", "issues", n]) | (Provider::GitLab, ["issues", n]) => {
            (ResourceKind::Issue, *n)
        }
        (Provider::GitLab, ["-", "merge_requests", n])
        | (Provider::GitLab, ["merge_requests", n]) => (ResourceKind::Proposal, *n),
        _ => return Err(bad(url)),
    };

    let number: i64 = number_str.parse().map_err(|_| bad(url))?;
    if number <= 0 {
        return Err(bad(url));
    }

    Ok(ResourceRef {
        provider,
        owner: owner.to_string(),
        repo: repo.to_string(),
        number,
        kind,
    })
}
