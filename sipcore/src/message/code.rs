use std::fmt;

/// A SIP response status code.
///
/// The codes of RFC 3261 §21 and the extension codes this stack emits
/// are declared as variants; anything else is carried in
/// [`StatusCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// 100 Trying.
    Trying,
    /// 180 Ringing.
    Ringing,
    /// 181 Call Is Being Forwarded.
    CallIsBeingForwarded,
    /// 182 Queued.
    Queued,
    /// 183 Session Progress.
    SessionProgress,
    /// 200 OK.
    Ok,
    /// 202 Accepted.
    Accepted,
    /// 300 Multiple Choices.
    MultipleChoices,
    /// 301 Moved Permanently.
    MovedPermanently,
    /// 302 Moved Temporarily.
    MovedTemporarily,
    /// 305 Use Proxy.
    UseProxy,
    /// 380 Alternative Service.
    AlternativeService,
    /// 400 Bad Request.
    BadRequest,
    /// 401 Unauthorized.
    Unauthorized,
    /// 403 Forbidden.
    Forbidden,
    /// 404 Not Found.
    NotFound,
    /// 405 Method Not Allowed.
    MethodNotAllowed,
    /// 407 Proxy Authentication Required.
    ProxyAuthenticationRequired,
    /// 408 Request Timeout.
    RequestTimeout,
    /// 410 Gone.
    Gone,
    /// 420 Bad Extension.
    BadExtension,
    /// 423 Interval Too Brief.
    IntervalTooBrief,
    /// 439 First Hop Lacks Outbound Support (RFC 5626).
    FirstHopLacksOutbound,
    /// 480 Temporarily Unavailable.
    TemporarilyUnavailable,
    /// 481 Call/Transaction Does Not Exist.
    CallOrTransactionDoesNotExist,
    /// 482 Loop Detected.
    LoopDetected,
    /// 483 Too Many Hops.
    TooManyHops,
    /// 484 Address Incomplete.
    AddressIncomplete,
    /// 485 Ambiguous.
    Ambiguous,
    /// 486 Busy Here.
    BusyHere,
    /// 487 Request Terminated.
    RequestTerminated,
    /// 488 Not Acceptable Here.
    NotAcceptableHere,
    /// 489 Bad Event (RFC 6665).
    BadEvent,
    /// 491 Request Pending.
    RequestPending,
    /// 500 Server Internal Error.
    ServerInternalError,
    /// 501 Not Implemented.
    NotImplemented,
    /// 502 Bad Gateway.
    BadGateway,
    /// 503 Service Unavailable.
    ServiceUnavailable,
    /// 504 Server Time-out.
    ServerTimeout,
    /// 505 Version Not Supported.
    VersionNotSupported,
    /// 600 Busy Everywhere.
    BusyEverywhere,
    /// 603 Decline.
    Decline,
    /// 604 Does Not Exist Anywhere.
    DoesNotExistAnywhere,
    /// 606 Not Acceptable.
    NotAcceptable,
    /// Any other status code.
    Other(u16),
}

impl StatusCode {
    /// Returns the numeric value of the code.
    pub fn into_u16(self) -> u16 {
        match self {
            StatusCode::Trying => 100,
            StatusCode::Ringing => 180,
            StatusCode::CallIsBeingForwarded => 181,
            StatusCode::Queued => 182,
            StatusCode::SessionProgress => 183,
            StatusCode::Ok => 200,
            StatusCode::Accepted => 202,
            StatusCode::MultipleChoices => 300,
            StatusCode::MovedPermanently => 301,
            StatusCode::MovedTemporarily => 302,
            StatusCode::UseProxy => 305,
            StatusCode::AlternativeService => 380,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::ProxyAuthenticationRequired => 407,
            StatusCode::RequestTimeout => 408,
            StatusCode::Gone => 410,
            StatusCode::BadExtension => 420,
            StatusCode::IntervalTooBrief => 423,
            StatusCode::FirstHopLacksOutbound => 439,
            StatusCode::TemporarilyUnavailable => 480,
            StatusCode::CallOrTransactionDoesNotExist => 481,
            StatusCode::LoopDetected => 482,
            StatusCode::TooManyHops => 483,
            StatusCode::AddressIncomplete => 484,
            StatusCode::Ambiguous => 485,
            StatusCode::BusyHere => 486,
            StatusCode::RequestTerminated => 487,
            StatusCode::NotAcceptableHere => 488,
            StatusCode::BadEvent => 489,
            StatusCode::RequestPending => 491,
            StatusCode::ServerInternalError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::ServerTimeout => 504,
            StatusCode::VersionNotSupported => 505,
            StatusCode::BusyEverywhere => 600,
            StatusCode::Decline => 603,
            StatusCode::DoesNotExistAnywhere => 604,
            StatusCode::NotAcceptable => 606,
            StatusCode::Other(code) => code,
        }
    }

    /// Returns the default reason phrase for the code.
    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Trying => "Trying",
            StatusCode::Ringing => "Ringing",
            StatusCode::CallIsBeingForwarded => "Call Is Being Forwarded",
            StatusCode::Queued => "Queued",
            StatusCode::SessionProgress => "Session Progress",
            StatusCode::Ok => "OK",
            StatusCode::Accepted => "Accepted",
            StatusCode::MultipleChoices => "Multiple Choices",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::MovedTemporarily => "Moved Temporarily",
            StatusCode::UseProxy => "Use Proxy",
            StatusCode::AlternativeService => "Alternative Service",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::ProxyAuthenticationRequired => "Proxy Authentication Required",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::Gone => "Gone",
            StatusCode::BadExtension => "Bad Extension",
            StatusCode::IntervalTooBrief => "Interval Too Brief",
            StatusCode::FirstHopLacksOutbound => "First Hop Lacks Outbound Support",
            StatusCode::TemporarilyUnavailable => "Temporarily Unavailable",
            StatusCode::CallOrTransactionDoesNotExist => "Call/Transaction Does Not Exist",
            StatusCode::LoopDetected => "Loop Detected",
            StatusCode::TooManyHops => "Too Many Hops",
            StatusCode::AddressIncomplete => "Address Incomplete",
            StatusCode::Ambiguous => "Ambiguous",
            StatusCode::BusyHere => "Busy Here",
            StatusCode::RequestTerminated => "Request Terminated",
            StatusCode::NotAcceptableHere => "Not Acceptable Here",
            StatusCode::BadEvent => "Bad Event",
            StatusCode::RequestPending => "Request Pending",
            StatusCode::ServerInternalError => "Server Internal Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::ServerTimeout => "Server Time-out",
            StatusCode::VersionNotSupported => "Version Not Supported",
            StatusCode::BusyEverywhere => "Busy Everywhere",
            StatusCode::Decline => "Decline",
            StatusCode::DoesNotExistAnywhere => "Does Not Exist Anywhere",
            StatusCode::NotAcceptable => "Not Acceptable",
            StatusCode::Other(_) => "Unknown",
        }
    }

    /// Returns `true` for 1xx codes.
    pub fn is_provisional(&self) -> bool {
        matches!(self.into_u16(), 100..=199)
    }

    /// Returns `true` for 2xx..6xx codes.
    pub fn is_final(&self) -> bool {
        self.into_u16() >= 200
    }

    /// Returns the response class (1..=6).
    pub fn class(&self) -> u16 {
        self.into_u16() / 100
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        match code {
            100 => StatusCode::Trying,
            180 => StatusCode::Ringing,
            181 => StatusCode::CallIsBeingForwarded,
            182 => StatusCode::Queued,
            183 => StatusCode::SessionProgress,
            200 => StatusCode::Ok,
            202 => StatusCode::Accepted,
            300 => StatusCode::MultipleChoices,
            301 => StatusCode::MovedPermanently,
            302 => StatusCode::MovedTemporarily,
            305 => StatusCode::UseProxy,
            380 => StatusCode::AlternativeService,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            405 => StatusCode::MethodNotAllowed,
            407 => StatusCode::ProxyAuthenticationRequired,
            408 => StatusCode::RequestTimeout,
            410 => StatusCode::Gone,
            420 => StatusCode::BadExtension,
            423 => StatusCode::IntervalTooBrief,
            439 => StatusCode::FirstHopLacksOutbound,
            480 => StatusCode::TemporarilyUnavailable,
            481 => StatusCode::CallOrTransactionDoesNotExist,
            482 => StatusCode::LoopDetected,
            483 => StatusCode::TooManyHops,
            484 => StatusCode::AddressIncomplete,
            485 => StatusCode::Ambiguous,
            486 => StatusCode::BusyHere,
            487 => StatusCode::RequestTerminated,
            488 => StatusCode::NotAcceptableHere,
            489 => StatusCode::BadEvent,
            491 => StatusCode::RequestPending,
            500 => StatusCode::ServerInternalError,
            501 => StatusCode::NotImplemented,
            502 => StatusCode::BadGateway,
            503 => StatusCode::ServiceUnavailable,
            504 => StatusCode::ServerTimeout,
            505 => StatusCode::VersionNotSupported,
            600 => StatusCode::BusyEverywhere,
            603 => StatusCode::Decline,
            604 => StatusCode::DoesNotExistAnywhere,
            606 => StatusCode::NotAcceptable,
            other => StatusCode::Other(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.into_u16())
    }
}
