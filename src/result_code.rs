//! LDAP result codes (RFC 4511 Appendix A, RFC 3909, RFC 4533).

use std::fmt;

/// An LDAP result code.
///
/// Codes outside the table are preserved as-is so that a server's answer is
/// never rewritten on the way to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultCode(i32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const TIME_LIMIT_EXCEEDED: ResultCode = ResultCode(3);
    pub const SIZE_LIMIT_EXCEEDED: ResultCode = ResultCode(4);
    pub const COMPARE_FALSE: ResultCode = ResultCode(5);
    pub const COMPARE_TRUE: ResultCode = ResultCode(6);
    pub const AUTH_METHOD_NOT_SUPPORTED: ResultCode = ResultCode(7);
    pub const STRONGER_AUTH_REQUIRED: ResultCode = ResultCode(8);
    pub const REFERRAL: ResultCode = ResultCode(10);
    pub const ADMIN_LIMIT_EXCEEDED: ResultCode = ResultCode(11);
    pub const UNAVAILABLE_CRITICAL_EXTENSION: ResultCode = ResultCode(12);
    pub const CONFIDENTIALITY_REQUIRED: ResultCode = ResultCode(13);
    pub const SASL_BIND_IN_PROGRESS: ResultCode = ResultCode(14);
    pub const NO_SUCH_ATTRIBUTE: ResultCode = ResultCode(16);
    pub const UNDEFINED_ATTRIBUTE_TYPE: ResultCode = ResultCode(17);
    pub const INAPPROPRIATE_MATCHING: ResultCode = ResultCode(18);
    pub const CONSTRAINT_VIOLATION: ResultCode = ResultCode(19);
    pub const ATTRIBUTE_OR_VALUE_EXISTS: ResultCode = ResultCode(20);
    pub const INVALID_ATTRIBUTE_SYNTAX: ResultCode = ResultCode(21);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const ALIAS_PROBLEM: ResultCode = ResultCode(33);
    pub const INVALID_DN_SYNTAX: ResultCode = ResultCode(34);
    pub const ALIAS_DEREFERENCING_PROBLEM: ResultCode = ResultCode(36);
    pub const INAPPROPRIATE_AUTHENTICATION: ResultCode = ResultCode(48);
    pub const INVALID_CREDENTIALS: ResultCode = ResultCode(49);
    pub const INSUFFICIENT_ACCESS_RIGHTS: ResultCode = ResultCode(50);
    pub const BUSY: ResultCode = ResultCode(51);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const UNWILLING_TO_PERFORM: ResultCode = ResultCode(53);
    pub const LOOP_DETECT: ResultCode = ResultCode(54);
    pub const NAMING_VIOLATION: ResultCode = ResultCode(64);
    pub const OBJECT_CLASS_VIOLATION: ResultCode = ResultCode(65);
    pub const NOT_ALLOWED_ON_NON_LEAF: ResultCode = ResultCode(66);
    pub const NOT_ALLOWED_ON_RDN: ResultCode = ResultCode(67);
    pub const ENTRY_ALREADY_EXISTS: ResultCode = ResultCode(68);
    pub const OBJECT_CLASS_MODS_PROHIBITED: ResultCode = ResultCode(69);
    pub const AFFECTS_MULTIPLE_DSAS: ResultCode = ResultCode(71);
    pub const OTHER: ResultCode = ResultCode(80);
    pub const CANCELED: ResultCode = ResultCode(118);
    pub const NO_SUCH_OPERATION: ResultCode = ResultCode(119);
    pub const TOO_LATE: ResultCode = ResultCode(120);
    pub const CANNOT_CANCEL: ResultCode = ResultCode(121);
    pub const SYNC_REFRESH_REQUIRED: ResultCode = ResultCode(4096);

    pub const fn new(code: i32) -> Self {
        ResultCode(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }

    /// Codes that do not indicate a failed operation.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResultCode::SUCCESS
                | ResultCode::COMPARE_TRUE
                | ResultCode::COMPARE_FALSE
                | ResultCode::SASL_BIND_IN_PROGRESS
        )
    }

    pub fn short_name(self) -> &'static str {
        lookup(self.0).map(|(_, name, _)| name).unwrap_or("unknown")
    }

    pub fn description(self) -> &'static str {
        lookup(self.0)
            .map(|(_, _, desc)| desc)
            .unwrap_or("The result code is not recognized.")
    }
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        ResultCode(code)
    }
}

impl From<ResultCode> for i32 {
    fn from(code: ResultCode) -> Self {
        code.0
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.short_name(), self.0)
    }
}

fn lookup(code: i32) -> Option<(i32, &'static str, &'static str)> {
    MEANINGS.iter().copied().find(|(c, _, _)| *c == code)
}

const MEANINGS: &[(i32, &str, &str)] = &[
    (0, "success", "The operation completed successfully."),
    (1, "operationsError", "The operation is not properly sequenced with relation to other operations."),
    (2, "protocolError", "The server received data that is not well-formed."),
    (3, "timeLimitExceeded", "The time limit specified by the client was exceeded before the operation could complete."),
    (4, "sizeLimitExceeded", "The size limit specified by the client was exceeded before the operation could complete."),
    (5, "compareFalse", "The Compare operation completed and the assertion evaluated to FALSE."),
    (6, "compareTrue", "The Compare operation completed and the assertion evaluated to TRUE."),
    (7, "authMethodNotSupported", "The authentication method or mechanism is not supported."),
    (8, "strongerAuthRequired", "The server requires stronger authentication in order to complete the request."),
    (10, "referral", "A referral needs to be chased to complete the operation."),
    (11, "adminLimitExceeded", "An administrative limit has been exceeded."),
    (12, "unavailableCriticalExtension", "A critical control is unrecognized."),
    (13, "confidentialityRequired", "Data confidentiality protections are required."),
    (14, "saslBindInProgress", "The server requires the client to send a new bind request to continue SASL authentication."),
    (16, "noSuchAttribute", "The named entry does not contain the specified attribute or attribute value."),
    (17, "undefinedAttributeType", "A request field contains an unrecognized attribute description."),
    (18, "inappropriateMatching", "An attempt was made to use a matching rule not defined for the attribute type concerned."),
    (19, "constraintViolation", "The client supplied an attribute value that does not conform to the constraints placed upon it."),
    (20, "attributeOrValueExists", "The client supplied an attribute or value to be added to an entry, but it already exists."),
    (21, "invalidAttributeSyntax", "A purported attribute value does not conform to the syntax of the attribute."),
    (32, "noSuchObject", "The object does not exist in the DIT."),
    (33, "aliasProblem", "An alias problem has occurred."),
    (34, "invalidDNSyntax", "An LDAPDN or RelativeLDAPDN field does not conform to the required syntax."),
    (36, "aliasDereferencingProblem", "A problem occurred while dereferencing an alias."),
    (48, "inappropriateAuthentication", "The server requires the client to bind with credentials rather than anonymously."),
    (49, "invalidCredentials", "The provided credentials are invalid."),
    (50, "insufficientAccessRights", "The client does not have sufficient access rights to perform the operation."),
    (51, "busy", "The server is too busy to service the operation."),
    (52, "unavailable", "The server is shutting down or a subsystem is unavailable."),
    (53, "unwillingToPerform", "The server is unwilling to perform the operation."),
    (54, "loopDetect", "The server has detected an internal loop."),
    (64, "namingViolation", "The entry's name violates naming restrictions."),
    (65, "objectClassViolation", "The entry violates object class restrictions."),
    (66, "notAllowedOnNonLeaf", "The operation is inappropriately acting upon a non-leaf entry."),
    (67, "notAllowedOnRDN", "The operation is inappropriately attempting to remove a value that forms the entry's RDN."),
    (68, "entryAlreadyExists", "The request cannot be fulfilled as the entry already exists."),
    (69, "objectClassModsProhibited", "An attempt to modify the object class(es) of an entry's objectClass attribute is prohibited."),
    (71, "affectsMultipleDSAs", "The operation cannot be performed as it would affect multiple servers."),
    (80, "other", "The server has encountered an internal error."),
    (118, "canceled", "The operation was canceled."),
    (119, "noSuchOperation", "The server has no knowledge of the operation requested for cancellation."),
    (120, "tooLate", "The operation to be canceled has already progressed too far."),
    (121, "cannotCancel", "The identified operation does not support cancellation."),
    (4096, "e-syncRefreshRequired", "The sync session must be refreshed from the beginning."),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_code_meaning() {
        assert_eq!(ResultCode::INVALID_CREDENTIALS.short_name(), "invalidCredentials");
        assert_eq!(ResultCode::new(49), ResultCode::INVALID_CREDENTIALS);
        assert!(ResultCode::PROTOCOL_ERROR.description().contains("not well-formed"));
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let code = ResultCode::from(9999);
        assert_eq!(code.code(), 9999);
        assert_eq!(code.short_name(), "unknown");
    }

    #[test]
    fn test_success_like_codes() {
        assert!(ResultCode::SUCCESS.is_success());
        assert!(ResultCode::COMPARE_FALSE.is_success());
        assert!(ResultCode::SASL_BIND_IN_PROGRESS.is_success());
        assert!(!ResultCode::REFERRAL.is_success());
        assert!(!ResultCode::OTHER.is_success());
    }
}
