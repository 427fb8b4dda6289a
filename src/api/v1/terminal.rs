use std::str::FromStr;

use axum::{
    extract::{Path, State},
    Json,
};
use bson::oid::ObjectId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::Error;
use crate::util::{DecimalString, ObjectIdString};

use super::member::MemberCollection;
use super::token::MemberSession;

/// Locker sizes a terminal can carry. Inbound strings are matched
/// case-insensitively since kiosks are not consistent about casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockerSize {
    Small,
    Medium,
    Large,
    Xl,
    Custom,
}

impl LockerSize {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "SMALL",
            Self::Medium => "MEDIUM",
            Self::Large => "LARGE",
            Self::Xl => "XL",
            Self::Custom => "CUSTOM",
        }
    }
}

impl FromStr for LockerSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SMALL" => Ok(Self::Small),
            "MEDIUM" => Ok(Self::Medium),
            "LARGE" => Ok(Self::Large),
            "XL" => Ok(Self::Xl),
            "CUSTOM" => Ok(Self::Custom),
            _ => Err(Error::InvalidFields),
        }
    }
}

impl Serialize for LockerSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LockerSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| {
            serde::de::Error::unknown_variant(&s, &["SMALL", "MEDIUM", "LARGE", "XL", "CUSTOM"])
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerStatus {
    Available,
    #[serde(rename = "In Use")]
    InUse,
    Unavailable,
    Maintenance,
}

impl LockerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::InUse => "In Use",
            Self::Unavailable => "Unavailable",
            Self::Maintenance => "Maintenance",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LockerProduct {
    pub name: String,
    pub price: Decimal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Locker {
    pub locker_number: i32,
    pub size: LockerSize,
    pub status: LockerStatus,
    pub dimensions: Option<String>,
    #[serde(default)]
    pub products: Vec<LockerProduct>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PriceEntry {
    pub size: LockerSize,
    pub price: Decimal,
}

/// Usage pricing for a terminal: the first `time` units of `duration`
/// are covered by the base price, every further unit bills the per-size
/// rate from `prices`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PricingTable {
    pub duration: String,
    pub time: i64,
    pub prices: Vec<PriceEntry>,
    /// Member who last changed the table.
    pub operator: Option<ObjectId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub pincode: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TerminalModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    /// Stable key handed to kiosks; travels in the `x-api-key` header.
    pub uuid: String,
    pub name: String,
    pub address: Address,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub face_enabled: bool,
    /// Payment is taken at drop-off; pickups only quote overstay balances.
    pub drop_payment_required: bool,
    pub is_active: bool,

    pub lockers: Vec<Locker>,
    pub base_price: Option<Decimal>,
    pub price: Option<PricingTable>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct TerminalCollection(pub crate::mongo_ext::Collection<TerminalModel>);

impl std::ops::Deref for TerminalCollection {
    type Target = crate::mongo_ext::Collection<TerminalModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TerminalCollection {
    pub async fn find_by_uuid(&self, uuid: &str) -> Result<Option<TerminalModel>, Error> {
        self.find_one(bson::doc! { "uuid": uuid }, None)
            .await
            .map_err(Into::into)
    }

    /// Flips one Available locker to In Use, but only if it is still
    /// Available at write time. Returns false when someone else claimed
    /// it first.
    pub async fn claim_locker(
        &self,
        db_session: &mut mongodb::ClientSession,
        terminal_id: ObjectId,
        locker_number: i32,
    ) -> Result<bool, Error> {
        let result = self
            .update_one_with_session(
                claim_filter(terminal_id, locker_number),
                bson::doc! {
                    "$set": {
                        "lockers.$.status": LockerStatus::InUse.as_str(),
                        "updatedAt": bson::DateTime::now(),
                    }
                },
                None,
                db_session,
            )
            .await?;

        Ok(result.modified_count == 1)
    }

    pub async fn set_locker_status(
        &self,
        terminal_id: ObjectId,
        locker_number: i32,
        status: LockerStatus,
    ) -> Result<(), Error> {
        self.update_one(
            bson::doc! {
                "_id": terminal_id,
                "lockers.lockerNumber": locker_number,
            },
            bson::doc! {
                "$set": {
                    "lockers.$.status": status.as_str(),
                    "updatedAt": bson::DateTime::now(),
                }
            },
            None,
        )
        .await?;

        Ok(())
    }

    pub async fn release_locker(
        &self,
        terminal_id: ObjectId,
        locker_number: i32,
    ) -> Result<(), Error> {
        self.set_locker_status(terminal_id, locker_number, LockerStatus::Available)
            .await
    }
}

/// Filter a claim must satisfy: the locker is still Available at write
/// time. Locker numbers are unique within a terminal, so the size does
/// not need to be part of the match.
pub fn claim_filter(terminal_id: ObjectId, locker_number: i32) -> bson::Document {
    bson::doc! {
        "_id": terminal_id,
        "lockers": {
            "$elemMatch": {
                "lockerNumber": locker_number,
                "status": LockerStatus::Available.as_str(),
            }
        }
    }
}

/// Picks the first Available locker of the requested size.
pub fn find_available_locker(lockers: &[Locker], size: LockerSize) -> Result<&Locker, Error> {
    if lockers.is_empty() {
        return Err(Error::LockersNotFound);
    }

    let locker = lockers
        .iter()
        .find(|locker| locker.size == size && locker.status == LockerStatus::Available)
        .ok_or_else(|| Error::LockerNotAvailable(size.as_str().to_string()))?;

    // a zero or negative number means the document was seeded wrong
    if locker.locker_number <= 0 {
        return Err(Error::LockerNotFound);
    }

    Ok(locker)
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LockerGroupSpec {
    pub size: LockerSize,
    #[validate(range(min = 1, max = 500))]
    pub count: u32,
    pub dimensions: Option<String>,
    #[serde(default)]
    pub products: Vec<LockerProduct>,
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub address: Address,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub face_enabled: bool,
    #[serde(default)]
    pub drop_payment_required: bool,
    pub base_price: Option<DecimalString>,
    #[validate]
    pub lockers: Vec<LockerGroupSpec>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalResponse {
    pub terminal_id: ObjectIdString,
    pub uuid: String,
    pub locker_count: usize,
}

pub async fn create_terminal(
    session: MemberSession,
    State(members): State<MemberCollection>,
    State(terminals): State<TerminalCollection>,
    Json(request): Json<CreateTerminalRequest>,
) -> Result<Json<CreateTerminalResponse>, Error> {
    let mut missing = vec![];
    if request.name.trim().is_empty() {
        missing.push("name");
    }
    if request.lockers.is_empty() {
        missing.push("lockers");
    }
    if !missing.is_empty() {
        return Err(Error::MissingFields(missing.join(", ")));
    }

    request.validate()?;

    let creator = members.resolve_session(&session).await?;
    if !creator.role.can_update_pricing() {
        return Err(Error::MemberNotAuthorized);
    }

    // a terminal without per-locker products has nothing to bill against
    // except the base price, so it must be present
    let has_empty_products = request.lockers.iter().any(|group| group.products.is_empty());
    if has_empty_products && request.base_price.is_none() {
        return Err(Error::MissingBasePrice);
    }

    let mut lockers = Vec::new();
    let mut next_number = 1;
    for group in &request.lockers {
        for _ in 0..group.count {
            lockers.push(Locker {
                locker_number: next_number,
                size: group.size,
                status: LockerStatus::Available,
                dimensions: group.dimensions.clone(),
                products: group.products.clone(),
            });
            next_number += 1;
        }
    }

    let now = bson::DateTime::now();
    let terminal = TerminalModel {
        id: ObjectId::new(),
        uuid: uuid::Uuid::new_v4().to_string(),
        name: request.name,
        address: request.address,
        latitude: request.latitude,
        longitude: request.longitude,
        face_enabled: request.face_enabled,
        drop_payment_required: request.drop_payment_required,
        is_active: true,
        lockers,
        base_price: request.base_price.map(Into::into),
        price: None,
        created_at: now,
        updated_at: now,
    };

    terminals.insert_one(&terminal, None).await?;

    Ok(Json(CreateTerminalResponse {
        terminal_id: terminal.id.into(),
        uuid: terminal.uuid,
        locker_count: terminal.lockers.len(),
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTerminalRequest {
    pub terminal_id: ObjectIdString,
    #[validate(length(min = 1))]
    pub name: Option<String>,
    pub address: Option<Address>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub face_enabled: Option<bool>,
    pub drop_payment_required: Option<bool>,
    pub is_active: Option<bool>,
    pub base_price: Option<DecimalString>,
}

pub async fn update_terminal_details(
    session: MemberSession,
    State(members): State<MemberCollection>,
    State(terminals): State<TerminalCollection>,
    Json(request): Json<UpdateTerminalRequest>,
) -> Result<Json<super::user::MessageResponse>, Error> {
    request.validate()?;

    let member = members.resolve_session(&session).await?;
    if !member.role.can_update_pricing() {
        return Err(Error::MemberNotAuthorized);
    }

    let terminal = terminals
        .find_one_by_id(request.terminal_id.0)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    let mut set = bson::doc! { "updatedAt": bson::DateTime::now() };

    if let Some(name) = request.name {
        set.insert("name", name);
    }
    if let Some(address) = request.address {
        set.insert("address", bson::to_bson(&address)?);
    }
    if let Some(latitude) = request.latitude {
        set.insert("latitude", latitude);
    }
    if let Some(longitude) = request.longitude {
        set.insert("longitude", longitude);
    }
    if let Some(face_enabled) = request.face_enabled {
        set.insert("faceEnabled", face_enabled);
    }
    if let Some(drop_payment_required) = request.drop_payment_required {
        set.insert("dropPaymentRequired", drop_payment_required);
    }
    if let Some(is_active) = request.is_active {
        set.insert("isActive", is_active);
    }
    if let Some(base_price) = request.base_price {
        set.insert("basePrice", bson::to_bson(&Decimal::from(base_price))?);
    }

    terminals
        .update_one_by_id(terminal.id, bson::doc! { "$set": set })
        .await?;

    Ok(Json(super::user::MessageResponse {
        message: "Terminal updated.".to_string(),
    }))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PriceEntryRequest {
    pub size: LockerSize,
    pub price: DecimalString,
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePricingRequest {
    pub terminal_id: ObjectIdString,
    #[validate(length(min = 1))]
    pub duration: String,
    #[validate(range(min = 0))]
    pub time: i64,
    pub prices: Vec<PriceEntryRequest>,
    pub base_price: Option<DecimalString>,
}

/// Replaces a terminal's pricing table. Restricted to admin roles, and
/// the acting member is recorded as the table's operator.
pub async fn update_pricing(
    session: MemberSession,
    State(members): State<MemberCollection>,
    State(terminals): State<TerminalCollection>,
    Json(request): Json<UpdatePricingRequest>,
) -> Result<Json<super::user::MessageResponse>, Error> {
    request.validate()?;

    let member = members.resolve_session(&session).await?;
    if !member.role.can_update_pricing() {
        return Err(Error::MemberNotAuthorized);
    }

    if request.prices.is_empty() {
        return Err(Error::RequiredFields("prices"));
    }

    let mut prices = Vec::with_capacity(request.prices.len());
    for entry in request.prices {
        let price = Decimal::from(entry.price);
        if price.is_sign_negative() {
            return Err(Error::InvalidFields);
        }
        prices.push(PriceEntry {
            size: entry.size,
            price,
        });
    }

    let terminal = terminals
        .find_one_by_id(request.terminal_id.0)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    let table = PricingTable {
        duration: request.duration,
        time: request.time,
        prices,
        operator: Some(member.id),
    };

    let mut set = bson::doc! {
        "price": bson::to_bson(&table)?,
        "updatedAt": bson::DateTime::now(),
    };

    if let Some(base_price) = request.base_price {
        let base_price = Decimal::from(base_price);
        if base_price.is_sign_negative() {
            return Err(Error::InvalidFields);
        }
        set.insert("basePrice", bson::to_bson(&base_price)?);
    }

    terminals
        .update_one_by_id(terminal.id, bson::doc! { "$set": set })
        .await?;

    Ok(Json(super::user::MessageResponse {
        message: "Pricing updated.".to_string(),
    }))
}

pub async fn get_terminal(
    _session: MemberSession,
    State(terminals): State<TerminalCollection>,
    Path(id): Path<String>,
) -> Result<Json<TerminalModel>, Error> {
    let id = ObjectId::parse_str(&id).map_err(|_| Error::TerminalNotFound)?;

    let terminal = terminals
        .find_one_by_id(id)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    Ok(Json(terminal))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn locker(number: i32, size: LockerSize, status: LockerStatus) -> Locker {
        Locker {
            locker_number: number,
            size,
            status,
            dimensions: None,
            products: vec![],
        }
    }

    #[test]
    fn sizes_parse_case_insensitively() {
        assert_eq!("small".parse::<LockerSize>().unwrap(), LockerSize::Small);
        assert_eq!("Xl".parse::<LockerSize>().unwrap(), LockerSize::Xl);
        assert_eq!("MEDIUM".parse::<LockerSize>().unwrap(), LockerSize::Medium);
        assert!("tiny".parse::<LockerSize>().is_err());
    }

    #[test]
    fn allocation_picks_first_available_of_size() {
        let lockers = vec![
            locker(1, LockerSize::Small, LockerStatus::InUse),
            locker(2, LockerSize::Medium, LockerStatus::Available),
            locker(3, LockerSize::Small, LockerStatus::Available),
            locker(4, LockerSize::Small, LockerStatus::Available),
        ];

        let found = find_available_locker(&lockers, LockerSize::Small).unwrap();
        assert_eq!(found.locker_number, 3);
    }

    #[test]
    fn allocation_skips_maintenance_and_unavailable() {
        let lockers = vec![
            locker(1, LockerSize::Large, LockerStatus::Maintenance),
            locker(2, LockerSize::Large, LockerStatus::Unavailable),
        ];

        let error = find_available_locker(&lockers, LockerSize::Large).unwrap_err();
        assert_matches!(error, Error::LockerNotAvailable(size) if size == "LARGE");
    }

    #[test]
    fn allocation_reports_empty_terminals() {
        let error = find_available_locker(&[], LockerSize::Small).unwrap_err();
        assert_matches!(error, Error::LockersNotFound);
    }

    #[test]
    fn allocation_rejects_corrupt_locker_numbers() {
        let lockers = vec![locker(0, LockerSize::Small, LockerStatus::Available)];

        let error = find_available_locker(&lockers, LockerSize::Small).unwrap_err();
        assert_matches!(error, Error::LockerNotFound);
    }

    #[test]
    fn claim_only_matches_available_lockers() {
        let terminal_id = ObjectId::new();
        let filter = claim_filter(terminal_id, 7);

        assert_eq!(filter.get_object_id("_id").unwrap(), terminal_id);

        let elem = filter
            .get_document("lockers")
            .unwrap()
            .get_document("$elemMatch")
            .unwrap();
        assert_eq!(elem.get_i32("lockerNumber").unwrap(), 7);
        assert_eq!(elem.get_str("status").unwrap(), "Available");
    }

    #[test]
    fn locker_status_uses_display_strings() {
        assert_eq!(
            serde_json::to_value(LockerStatus::InUse).unwrap(),
            serde_json::json!("In Use")
        );
        assert_eq!(
            serde_json::from_value::<LockerStatus>(serde_json::json!("Available")).unwrap(),
            LockerStatus::Available
        );
    }
}
