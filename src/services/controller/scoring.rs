//! Answer validation, marks and answer distribution of a question.

use std::{collections::HashSet, time::Duration};

use thiserror::Error;
use uuid::Uuid;

use crate::dao::{
    cache::{OptionCount, ResponseAggregate},
    models::QuestionType,
    quiz_catalog::Question,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no option selected")]
    Empty,
    #[error("option `{0}` does not belong to the question")]
    UnknownOption(Uuid),
    #[error("option `{0}` selected twice")]
    Duplicate(Uuid),
    #[error("this question accepts a single option")]
    SingleExpected,
}

/// Check a selection against the options and type of `question`.
pub fn validate_selection(question: &Question, option_ids: &[Uuid]) -> Result<(), SelectionError> {
    if option_ids.is_empty() {
        return Err(SelectionError::Empty);
    }
    let single = matches!(
        question.question_type,
        QuestionType::SingleChoice | QuestionType::TrueFalse
    );
    if single && option_ids.len() > 1 {
        return Err(SelectionError::SingleExpected);
    }

    let mut seen = HashSet::with_capacity(option_ids.len());
    for id in option_ids {
        if !question.options.iter().any(|option| option.id == *id) {
            return Err(SelectionError::UnknownOption(*id));
        }
        if !seen.insert(*id) {
            return Err(SelectionError::Duplicate(*id));
        }
    }
    Ok(())
}

/// Sum of the marks of the chosen options, boosted by the time left when the
/// question rewards speed: `marks * (1 + factor * remaining / limit)`.
pub fn answer_marks(question: &Question, option_ids: &[Uuid], remaining: Duration) -> f64 {
    let base: f64 = question
        .options
        .iter()
        .filter(|option| option_ids.contains(&option.id))
        .map(|option| option.mark)
        .sum();

    if !question.have_time_factor || question.time_limit_secs == 0 {
        return base;
    }
    let limit = Duration::from_secs(question.time_limit_secs).as_secs_f64();
    let ratio = (remaining.as_secs_f64() / limit).clamp(0.0, 1.0);
    base * (1.0 + question.time_factor * ratio)
}

/// Count how many answers picked each option of `question`.
pub fn distribution<'a>(
    question: &Question,
    order: u32,
    answers: impl IntoIterator<Item = &'a [Uuid]>,
) -> ResponseAggregate {
    let mut options: Vec<OptionCount> = question
        .options
        .iter()
        .map(|option| OptionCount {
            option_id: option.id,
            count: 0,
        })
        .collect();

    let mut total = 0;
    for chosen in answers {
        total += 1;
        for count in options.iter_mut() {
            if chosen.contains(&count.option_id) {
                count.count += 1;
            }
        }
    }

    ResponseAggregate {
        question_order: order,
        question_id: question.id,
        total,
        options,
    }
}
