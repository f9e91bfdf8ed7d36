use crate::error::ExecError;

const MAX_USER_ID_LEN: usize = 64;

/// Validate a user id before it is used in file names, bind specs and job names
pub fn validate_user_id(user_id: &str) -> Result<(), ExecError> {
    let valid = !user_id.is_empty()
        && user_id.len() <= MAX_USER_ID_LEN
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(ExecError::InvalidUserId(user_id.to_string()))
    }
}

/// Validate a scheduler job id before passing it to the status command
pub fn validate_job_id(job_id: &str) -> Result<(), ExecError> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(ExecError::InvalidJobId(job_id.to_string()))
    }
}

/// Quote a value for a POSIX shell script
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@%+,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
