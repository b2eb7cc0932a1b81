//! Fork state and response aggregation (RFC 3261 §16.7).
//!
//! One [`Fork`] exists per proxied server transaction. Branches are
//! client transactions; their responses feed the aggregator, which
//! picks the winner by the §16.7 total order regardless of arrival
//! order (ties broken by branch index).

use std::collections::VecDeque;

use crate::headers::Header;
use crate::message::{Response, StatusCode, StatusLine, Uri};
use crate::router::ProxyOpts;
use crate::transaction::TsxKey;

/// How branches are fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkMode {
    /// All targets at once.
    Parallel,
    /// One target at a time; the default for 3xx redirect chains.
    Serial,
}

/// One downstream branch of a fork.
#[derive(Debug)]
pub struct ForkBranch {
    pub key: TsxKey,
    pub index: usize,
    pub target: Uri,
    /// A provisional response has been seen (CANCEL may fire now).
    pub got_provisional: bool,
    /// A final response has been seen.
    pub completed: bool,
}

/// A final-response candidate held by the aggregator.
#[derive(Debug)]
struct Candidate {
    response: Response,
    branch_index: usize,
}

/// What the fork asks its owner to do next.
#[derive(Debug)]
pub enum ForkAction {
    /// Start a client transaction towards `target`.
    LaunchBranch { target: Uri },
    /// Send CANCEL on these still-pending branches.
    CancelBranches { keys: Vec<TsxKey> },
    /// Relay this response upstream through the server transaction.
    ForwardUpstream { response: Response },
}

/// The fork of one proxied request.
pub struct Fork {
    server_key: TsxKey,
    opts: ProxyOpts,
    mode: ForkMode,
    branches: Vec<ForkBranch>,
    /// Targets not yet launched (serial queue plus redirect contacts).
    pending_targets: VecDeque<Uri>,
    /// Best final candidate so far.
    best: Option<Candidate>,
    /// Authenticate headers collected from every 401/407.
    authenticate_headers: Vec<Header>,
    /// A 2xx was relayed; the fork only passes further 2xx through.
    answered: bool,
    cancelled: bool,
    next_index: usize,
}

impl Fork {
    pub fn new(server_key: TsxKey, targets: Vec<Uri>, mode: ForkMode, opts: ProxyOpts) -> (Self, Vec<ForkAction>) {
        let mut fork = Fork {
            server_key,
            opts,
            mode,
            branches: Vec::new(),
            pending_targets: targets.into(),
            best: None,
            authenticate_headers: Vec::new(),
            answered: false,
            cancelled: false,
            next_index: 0,
        };
        let actions = fork.launch_next();
        (fork, actions)
    }

    pub fn server_key(&self) -> &TsxKey {
        &self.server_key
    }

    pub fn opts(&self) -> &ProxyOpts {
        &self.opts
    }

    /// Pops the next target(s) to launch per the fork mode.
    fn launch_next(&mut self) -> Vec<ForkAction> {
        let mut actions = Vec::new();
        match self.mode {
            ForkMode::Parallel => {
                while let Some(target) = self.pending_targets.pop_front() {
                    actions.push(ForkAction::LaunchBranch { target });
                }
            }
            ForkMode::Serial => {
                if let Some(target) = self.pending_targets.pop_front() {
                    actions.push(ForkAction::LaunchBranch { target });
                }
            }
        }
        actions
    }

    /// Records the client transaction created for a launched target.
    pub fn branch_launched(&mut self, key: TsxKey, target: Uri) {
        let index = self.next_index;
        self.next_index += 1;
        self.branches.push(ForkBranch {
            key,
            index,
            target,
            got_provisional: false,
            completed: false,
        });
    }

    fn branch_mut(&mut self, key: &TsxKey) -> Option<&mut ForkBranch> {
        self.branches.iter_mut().find(|b| &b.key == key)
    }

    /// Keys of branches still waiting for a final response.
    fn pending_keys(&self) -> Vec<TsxKey> {
        self.branches
            .iter()
            .filter(|b| !b.completed)
            .map(|b| b.key.clone())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.pending_targets.is_empty() && self.branches.iter().all(|b| b.completed)
    }

    /// A provisional response from a branch: relay 1xx upstream
    /// (except 100, which is hop-by-hop).
    pub fn on_provisional(&mut self, key: &TsxKey, response: &Response) -> Vec<ForkAction> {
        if let Some(branch) = self.branch_mut(key) {
            branch.got_provisional = true;
        }
        if self.answered || response.code() == StatusCode::Trying {
            return Vec::new();
        }
        vec![ForkAction::ForwardUpstream {
            response: response.clone(),
        }]
    }

    /// A final response from a branch.
    pub fn on_final(&mut self, key: &TsxKey, response: &Response) -> Vec<ForkAction> {
        let Some(branch) = self.branch_mut(key) else {
            return Vec::new();
        };
        branch.completed = true;
        let branch_index = branch.index;

        let code = response.code();
        let class = code.class();
        let mut actions = Vec::new();

        match class {
            2 => {
                // Rule 10: every 2xx goes upstream; the first one
                // cancels everything still pending.
                if !self.answered {
                    self.answered = true;
                    let pending = self.pending_keys();
                    self.pending_targets.clear();
                    if !pending.is_empty() {
                        actions.push(ForkAction::CancelBranches { keys: pending });
                    }
                }
                actions.push(ForkAction::ForwardUpstream {
                    response: response.clone(),
                });
                return actions;
            }
            3 if self.opts.follow_redirects => {
                // Recurse on the 3xx contacts in received order; a
                // consumed redirect is not a candidate itself.
                let mut recursed = false;
                for contact in response.headers.contacts() {
                    if let Some(addr) = contact.addr() {
                        self.pending_targets.push_back(addr.uri().clone());
                        recursed = true;
                    }
                }
                if !recursed {
                    self.offer(response, branch_index);
                }
            }
            6 => {
                // Rule 6: a 6xx beats everything and ends the hunt.
                self.offer(response, branch_index);
                let pending = self.pending_keys();
                self.pending_targets.clear();
                if !pending.is_empty() {
                    actions.push(ForkAction::CancelBranches { keys: pending });
                }
            }
            _ => {
                self.offer(response, branch_index);
            }
        }

        if self.answered {
            return actions;
        }

        // Serial hunt: next target, if any.
        actions.extend(self.launch_next());

        if self.is_finished() {
            if let Some(best) = self.take_best() {
                actions.push(ForkAction::ForwardUpstream { response: best });
            }
        }

        actions
    }

    /// A branch timed out (timer B/F): counts as 408.
    pub fn on_branch_timeout(&mut self, key: &TsxKey) -> Vec<ForkAction> {
        let timeout = Response {
            status_line: StatusLine::from(StatusCode::RequestTimeout),
            headers: Default::default(),
            body: None,
        };
        self.on_final(key, &timeout)
    }

    /// Cancels every pending branch (application cancel or timer C).
    pub fn cancel_all(&mut self) -> Vec<ForkAction> {
        self.cancelled = true;
        self.pending_targets.clear();
        let pending = self.pending_keys();
        if pending.is_empty() {
            Vec::new()
        } else {
            vec![ForkAction::CancelBranches { keys: pending }]
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Offers a final response to the aggregator, keeping the §16.7
    /// winner: 6xx beats all, else the lowest class of 3xx/4xx/5xx;
    /// ties go to the lower branch index.
    fn offer(&mut self, response: &Response, branch_index: usize) {
        let code = response.code();

        // Collect authenticate headers of every 401/407 for merging.
        if matches!(
            code,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        ) {
            for header in response.headers.iter() {
                if matches!(
                    header,
                    Header::WwwAuthenticate(_) | Header::ProxyAuthenticate(_)
                ) {
                    self.authenticate_headers.push(header.clone());
                }
            }
        }

        let candidate = Candidate {
            response: response.clone(),
            branch_index,
        };

        match &self.best {
            None => self.best = Some(candidate),
            Some(best) => {
                if Self::beats(&candidate, best) {
                    self.best = Some(candidate);
                }
            }
        }
    }

    fn rank(code: StatusCode) -> u16 {
        match code.class() {
            // 6xx wins over everything.
            6 => 0,
            class => class,
        }
    }

    fn beats(candidate: &Candidate, best: &Candidate) -> bool {
        let (a, b) = (Self::rank(candidate.response.code()), Self::rank(best.response.code()));
        if a != b {
            return a < b;
        }
        candidate.branch_index < best.branch_index
    }

    /// Takes the aggregated upstream response: the best candidate with
    /// 401/407 challenges merged and 503 mapped to 500.
    fn take_best(&mut self) -> Option<Response> {
        let candidate = self.best.take()?;
        let mut response = candidate.response;
        let code = response.code();

        if matches!(
            code,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        ) {
            response
                .headers
                .retain(|h| !matches!(h, Header::WwwAuthenticate(_) | Header::ProxyAuthenticate(_)));
            response.headers.extend(self.authenticate_headers.drain(..));
        }

        // A 503 means this branch is unavailable, not the service
        // upstream of us (RFC 3261 §16.7).
        if code == StatusCode::ServiceUnavailable {
            response.status_line = StatusLine::from(StatusCode::ServerInternalError);
        }

        Some(response)
    }
}
